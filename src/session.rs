//! Lifecycle of the single sandbox attached to a project view.
//!
//! ```text
//! Uninitialized --boot--> Installing --exit 0--> Ready
//!                              |
//!                              +--exit != 0 / error--> Failed (terminal)
//! ```
//!
//! Once `Ready`, one interactive shell stays open. Its output is pumped in
//! order through the [`ProcessStateMachine`] and broadcast to subscribers.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{SessionError, SessionResult};
use crate::path_codec::LogicalPath;
use crate::process_state::{ProcessEvent, ProcessState, ProcessStateMachine, TestOutcome};
use crate::runtime::{FsChange, InputWriter, OutputStream, SandboxHandle, SandboxRuntime};
use crate::settings::Settings;
use crate::timing::TimingReport;
use crate::tree::Tree;

const EVENT_CAPACITY: usize = 256;
const INTERRUPT: &str = "\u{3}";
const TORN_DOWN: &str = "session torn down";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Dependency installation in progress, with the output seen so far.
    Installing { output: Vec<String> },
    Ready,
    Failed(String),
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    InstallLog(String),
    Output(String),
    Process(ProcessEvent),
}

struct SessionInner {
    state: SessionState,
    handle: Option<SandboxHandle>,
    shell_input: Option<InputWriter>,
    process: ProcessStateMachine,
    pump: Option<JoinHandle<()>>,
    /// Changes made while installing, replayed before `Ready`.
    pending: Vec<FsChange>,
}

pub struct SandboxSession {
    runtime: Arc<dyn SandboxRuntime>,
    settings: Settings,
    inner: Arc<Mutex<SessionInner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SandboxSession {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, settings: Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let process = ProcessStateMachine::new(settings.patterns.clone());
        Self {
            runtime,
            settings,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                handle: None,
                shell_input: None,
                process,
                pump: None,
                pending: Vec::new(),
            })),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.state.is_ready()
    }

    pub async fn process_state(&self) -> ProcessState {
        self.inner.lock().await.process.state()
    }

    pub async fn test_outcome(&self) -> Option<TestOutcome> {
        self.inner.lock().await.process.last_outcome()
    }

    pub async fn handle(&self) -> Option<SandboxHandle> {
        self.inner.lock().await.handle.clone()
    }

    /// Boots the sandbox, mounts `tree`, installs dependencies and opens the shell.
    ///
    /// Only valid from `Uninitialized`: a second boot gets `AlreadyBooted`,
    /// and a `Failed` session gets `Failed` because it has to be recreated.
    /// Any failure during boot leaves the session `Failed`.
    pub async fn boot(&self, tree: &Tree) -> SessionResult<()> {
        {
            let mut inner = self.inner.lock().await;
            match &inner.state {
                SessionState::Uninitialized => {}
                SessionState::Failed(reason) => return Err(SessionError::Failed(reason.clone())),
                SessionState::Installing { .. } | SessionState::Ready => {
                    return Err(SessionError::AlreadyBooted)
                }
            }
            inner.state = SessionState::Installing { output: Vec::new() };
        }
        self.emit(SessionEvent::StateChanged(SessionState::Installing {
            output: Vec::new(),
        }));

        let mut report = TimingReport::new("boot", "pending");
        match self.boot_phases(tree, &mut report).await {
            Ok(()) => {
                report.finish();
                Ok(())
            }
            Err(error) => {
                self.fail(error.to_string()).await;
                Err(error)
            }
        }
    }

    async fn boot_phases(&self, tree: &Tree, report: &mut TimingReport) -> SessionResult<()> {
        let handle = self.runtime.boot().await.map_err(|error| match error {
            SessionError::Boot(_) => error,
            other => SessionError::Boot(other.to_string()),
        })?;
        report.set_sandbox(handle.id.to_string());
        report.mark("boot");
        self.inner.lock().await.handle = Some(handle.clone());

        self.runtime.mount(&handle, &tree.to_mount_tree()).await?;
        report.mark("mount");

        if let Some((program, args)) = self.settings.install_argv() {
            info!(sandbox = %handle.id, command = %self.settings.install_command, "installing dependencies");
            let mut install = self.runtime.spawn(&handle, &program, &args).await?;
            while let Some(line) = install.output.recv().await {
                debug!(sandbox = %handle.id, "install: {line}");
                {
                    let mut inner = self.inner.lock().await;
                    if let SessionState::Installing { output } = &mut inner.state {
                        output.push(line.clone());
                    }
                }
                self.emit(SessionEvent::InstallLog(line));
            }
            let exit_code = install
                .exit
                .await
                .map_err(|_| SessionError::Runtime("install process exit status lost".into()))?;
            report.mark("install");
            if exit_code != 0 {
                warn!(sandbox = %handle.id, exit_code, "dependency installation failed");
                return Err(SessionError::InstallationFailed { exit_code });
            }
        }

        let shell = self
            .runtime
            .spawn_shell(&handle, &self.settings.shell)
            .await?;
        report.mark("shell");

        let pump = tokio::spawn(pump_output(
            shell.output,
            Arc::clone(&self.inner),
            self.events.clone(),
        ));
        {
            let mut inner = self.inner.lock().await;
            inner.shell_input = Some(shell.input);
            inner.pump = Some(pump);
        }
        self.replay_pending(&handle).await;
        report.mark("replay");
        self.emit(SessionEvent::StateChanged(SessionState::Ready));
        info!(sandbox = %handle.id, "sandbox session ready");
        Ok(())
    }

    async fn fail(&self, reason: String) {
        warn!("sandbox session failed: {reason}");
        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Failed(reason.clone());
            inner.shell_input = None;
            inner.pending.clear();
        }
        self.emit(SessionEvent::StateChanged(SessionState::Failed(reason)));
    }

    /// Applies changes queued during installation, then moves to `Ready`
    /// under the same lock so nothing queued later is missed.
    async fn replay_pending(&self, handle: &SandboxHandle) {
        loop {
            let batch = {
                let mut inner = self.inner.lock().await;
                if inner.pending.is_empty() {
                    inner.state = SessionState::Ready;
                    return;
                }
                std::mem::take(&mut inner.pending)
            };
            debug!(sandbox = %handle.id, changes = batch.len(), "replaying changes made during install");
            for change in &batch {
                if let Err(error) = change.apply(self.runtime.as_ref(), handle).await {
                    warn!(sandbox = %handle.id, ?change, "failed to replay sandbox change: {error}");
                }
            }
        }
    }

    /// Mirrors a filesystem change into the sandbox.
    ///
    /// While installing the change is queued and replayed before `Ready`.
    /// In any other state it is dropped; the tree already holds it and is
    /// mounted on the next boot.
    pub async fn apply(&self, change: FsChange) -> SessionResult<()> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, SessionState::Installing { .. }) {
                debug!(?change, "session installing, queueing sandbox change");
                inner.pending.push(change);
                return Ok(());
            }
            if inner.state.is_ready() {
                inner.handle.clone()
            } else {
                None
            }
        };
        let Some(handle) = handle else {
            debug!(?change, "session not ready, dropping sandbox change");
            return Ok(());
        };
        change.apply(self.runtime.as_ref(), &handle).await
    }

    pub async fn write_file(&self, path: &LogicalPath, contents: &str) -> SessionResult<()> {
        self.apply(FsChange::Write {
            path: path.to_real_path(),
            contents: contents.to_string(),
        })
        .await
    }

    pub async fn remove_path(&self, path: &LogicalPath) -> SessionResult<()> {
        self.apply(FsChange::Remove {
            path: path.to_real_path(),
        })
        .await
    }

    pub async fn rename_path(&self, from: &LogicalPath, to: &LogicalPath) -> SessionResult<()> {
        self.apply(FsChange::Rename {
            from: from.to_real_path(),
            to: to.to_real_path(),
        })
        .await
    }

    /// Merges `tree` into the sandbox filesystem.
    pub async fn mount(&self, tree: &Tree) -> SessionResult<()> {
        self.apply(FsChange::Mount(tree.to_mount_tree())).await
    }

    /// Writes `text` and a carriage return to the shell. Returns without
    /// waiting for the command; completion shows up as a process event.
    pub async fn run_command(&self, text: &str) -> SessionResult<()> {
        let event = {
            let mut inner = self.inner.lock().await;
            write_input(&inner, format!("{text}\r"))?;
            inner.process.on_run()
        };
        debug!(command = text, "command written");
        if let Some(event) = event {
            self.emit(SessionEvent::Process(event));
        }
        Ok(())
    }

    pub async fn run_tests(&self) -> SessionResult<()> {
        self.run_command(&self.settings.test_command).await
    }

    /// Sends the interrupt byte. Best effort: the process is only considered
    /// stopped once the shell redraws its prompt.
    pub async fn abort(&self) -> SessionResult<()> {
        let event = {
            let mut inner = self.inner.lock().await;
            write_input(&inner, INTERRUPT.to_string())?;
            inner.process.on_abort()
        };
        if let Some(event) = event {
            self.emit(SessionEvent::Process(event));
        }
        Ok(())
    }

    /// Stops the shell pump and releases the sandbox. The session ends up
    /// `Failed` and must be recreated to be used again.
    pub async fn teardown(&self) -> SessionResult<()> {
        let (handle, pump) = {
            let mut inner = self.inner.lock().await;
            inner.shell_input = None;
            inner.state = SessionState::Failed(TORN_DOWN.to_string());
            inner.pending.clear();
            (inner.handle.take(), inner.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        self.emit(SessionEvent::StateChanged(SessionState::Failed(
            TORN_DOWN.to_string(),
        )));
        match handle {
            Some(handle) => {
                info!(sandbox = %handle.id, "tearing down sandbox session");
                self.runtime.teardown(&handle).await
            }
            None => Ok(()),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn write_input(inner: &SessionInner, data: String) -> SessionResult<()> {
    if !inner.state.is_ready() {
        return Err(SessionError::NotReady);
    }
    let input = inner.shell_input.as_ref().ok_or(SessionError::NotReady)?;
    input
        .send(data.into_bytes())
        .map_err(|_| SessionError::Runtime("shell input closed".into()))
}

async fn pump_output(
    mut output: OutputStream,
    inner: Arc<Mutex<SessionInner>>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(chunk) = output.recv().await {
        let process_events = inner.lock().await.process.on_output(&chunk);
        let _ = events.send(SessionEvent::Output(chunk));
        for event in process_events {
            let _ = events.send(SessionEvent::Process(event));
        }
    }
    debug!("shell output closed");
}
