use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use playground_sandbox::persistence::{HttpBackend, PersistenceBackend};
use playground_sandbox::process_state::{ProcessEvent, ProcessState, TestOutcome};
use playground_sandbox::session::{SandboxSession, SessionEvent};
use playground_sandbox::settings::Settings;
use playground_sandbox::timing::enable_timing;
use playground_sandbox::tree::Tree;
use playground_sandbox::{LocalRuntime, DEFAULT_DATA_DIR};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "playground", author, version)]
struct Options {
    /// Directory for rolling log files; stdout only when unset
    #[arg(long, env = "PLAYGROUND_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,
    /// Log per-phase timings of sandbox operations
    #[arg(long, global = true)]
    timing: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot a local sandbox for a tree and run one command in its shell
    Run {
        #[command(flatten)]
        source: TreeSource,
        /// Command to run; defaults to the configured test command
        #[arg(long)]
        command: Option<String>,
        /// Directory used for sandbox workspaces
        #[arg(long, env = "PLAYGROUND_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Give up waiting for the shell prompt after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Validate a tree file and list its files and package scripts
    Check {
        #[command(flatten)]
        source: TreeSource,
    },
    /// Print the effective settings as JSON
    Config {
        /// Also write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

/// Where the project tree comes from.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TreeSource {
    /// Project tree in sandbox-native JSON
    #[arg(long)]
    tree: Option<PathBuf>,
    /// Project id to load from the persistence API
    #[arg(long)]
    project: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log_dir.as_deref());
    if options.timing {
        enable_timing();
    }
    let settings = Settings::load();

    match options.command {
        Command::Check { source } => check(&source, &settings).await,
        Command::Run {
            source,
            command,
            data_dir,
            timeout_secs,
        } => {
            let wait = Duration::from_secs(timeout_secs);
            run(&source, settings, command, data_dir, wait).await
        }
        Command::Config { save } => config(&settings, save),
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "playground.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

fn read_tree(path: &Path) -> anyhow::Result<Tree> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tree file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid tree in {}", path.display()))
}

async fn load_tree(source: &TreeSource, settings: &Settings) -> anyhow::Result<Tree> {
    match (&source.tree, &source.project) {
        (Some(path), _) => read_tree(path),
        (None, Some(project)) => {
            let backend = HttpBackend::new(settings.api_url.as_str());
            backend
                .load(project)
                .await
                .with_context(|| format!("failed to load project {project} from {}", settings.api_url))
        }
        (None, None) => Err(anyhow!("either --tree or --project is required")),
    }
}

async fn check(source: &TreeSource, settings: &Settings) -> anyhow::Result<()> {
    let tree = load_tree(source, settings).await?;
    for file in tree.files() {
        println!("{file}");
    }
    for (name, command) in tree.package_scripts() {
        println!("script {name}: {command}");
    }
    Ok(())
}

fn config(settings: &Settings, save: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if save {
        settings.save().context("failed to save settings")?;
        tracing::info!("settings saved");
    }
    Ok(())
}

async fn run(
    source: &TreeSource,
    settings: Settings,
    command: Option<String>,
    data_dir: Option<PathBuf>,
    wait: Duration,
) -> anyhow::Result<()> {
    let tree = load_tree(source, &settings).await?;
    let command = command.unwrap_or_else(|| settings.test_command.clone());
    let data_dir = data_dir.unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DATA_DIR));

    let runtime = LocalRuntime::new(data_dir).await?;
    let session = Arc::new(SandboxSession::new(Arc::new(runtime), settings));

    let printer = tokio::spawn(print_output(session.subscribe()));
    let mut events = session.subscribe();

    if let Err(error) = session.boot(&tree).await {
        let _ = session.teardown().await;
        printer.abort();
        return Err(anyhow!(error).context("sandbox did not become ready"));
    }

    if let Err(error) = session.run_command(&command).await {
        let _ = session.teardown().await;
        printer.abort();
        return Err(error.into());
    }
    let finished = timeout(wait, wait_for_idle(&session, &mut events)).await;
    let outcome = session.test_outcome().await;

    session.teardown().await?;
    printer.abort();

    match finished {
        Err(_) => Err(anyhow!("command still running after {}s", wait.as_secs())),
        Ok(Err(error)) => Err(error),
        Ok(Ok(())) => match outcome {
            Some(TestOutcome::Failed) => Err(anyhow!("tests failed")),
            Some(TestOutcome::Passed) => {
                tracing::info!("tests passed");
                Ok(())
            }
            None => Ok(()),
        },
    }
}

async fn print_output(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::InstallLog(line)) => println!("{line}"),
            Ok(SessionEvent::Output(chunk)) => print!("{chunk}"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "output printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Waits for the shell to go back to idle. Ctrl-C sends an interrupt once.
async fn wait_for_idle(
    session: &SandboxSession,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Process(ProcessEvent::StateChanged { from, to })) => {
                    tracing::info!(?from, ?to, "process state changed");
                    if to == ProcessState::Idle {
                        return Ok(());
                    }
                }
                Ok(SessionEvent::Process(ProcessEvent::TestFinished(outcome))) => {
                    tracing::info!(?outcome, "test run finished");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if session.process_state().await == ProcessState::Idle {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(anyhow!("session closed")),
            },
            result = tokio::signal::ctrl_c(), if !interrupted => {
                result.context("failed to listen for ctrl-c")?;
                tracing::info!("interrupt requested, aborting command");
                session.abort().await?;
                interrupted = true;
            }
        }
    }
}
