#![allow(dead_code)]

use std::time::Duration;

use playground_sandbox::errors::{
    PersistenceError, PersistenceResult, SessionError, SessionResult,
};
use playground_sandbox::persistence::{DeleteRequest, PersistenceBackend, UpdateRequest};
use playground_sandbox::runtime::{SandboxHandle, SandboxRuntime, ShellProcess, SpawnedProcess};
use playground_sandbox::session::SessionEvent;
use playground_sandbox::tree::{MountTree, Tree};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn sample_tree() -> Tree {
    serde_json::from_value(serde_json::json!({
        "package*json": {"file": {"contents": "{\"scripts\": {\"test\": \"jest\"}}"}},
        "src": {"directory": {
            "main*js": {"file": {"contents": "export const a = 1;"}},
            "util": {"directory": {
                "fmt*js": {"file": {"contents": ""}}
            }}
        }}
    }))
    .unwrap()
}

pub struct MockRuntime {
    install_exit: i32,
    install_lines: Vec<String>,
    fail_boot: bool,
    install_gate: Mutex<Option<oneshot::Receiver<()>>>,
    calls: Mutex<Vec<String>>,
    pub mounts: Mutex<Vec<MountTree>>,
    pub writes: Mutex<Vec<(String, String)>>,
    pub removed: Mutex<Vec<String>>,
    pub renamed: Mutex<Vec<(String, String)>>,
    shell_output: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shell_input: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MockRuntime {
    pub fn new(install_exit: i32, install_lines: &[&str]) -> Self {
        Self {
            install_exit,
            install_lines: install_lines.iter().map(|line| line.to_string()).collect(),
            fail_boot: false,
            install_gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            mounts: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            renamed: Mutex::new(Vec::new()),
            shell_output: Mutex::new(None),
            shell_input: Mutex::new(None),
        }
    }

    pub fn failing_boot() -> Self {
        Self {
            fail_boot: true,
            ..Self::new(0, &[])
        }
    }

    /// Install keeps running until the returned sender fires.
    pub fn gated_install(install_lines: &[&str]) -> (Self, oneshot::Sender<()>) {
        let (release, gate) = oneshot::channel();
        let runtime = Self {
            install_gate: Mutex::new(Some(gate)),
            ..Self::new(0, install_lines)
        };
        (runtime, release)
    }

    async fn record(&self, call: impl Into<String>) {
        self.calls.lock().await.push(call.into());
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Sender feeding the shell's output stream.
    pub async fn shell(&self) -> mpsc::UnboundedSender<String> {
        self.shell_output
            .lock()
            .await
            .clone()
            .expect("shell not spawned")
    }

    /// Next chunk the session wrote to the shell.
    pub async fn next_input(&self) -> String {
        let mut guard = self.shell_input.lock().await;
        let input = guard.as_mut().expect("shell not spawned");
        let bytes = tokio::time::timeout(WAIT, input.recv())
            .await
            .expect("timed out waiting for shell input")
            .expect("shell input closed");
        String::from_utf8(bytes).unwrap()
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for MockRuntime {
    async fn boot(&self) -> SessionResult<SandboxHandle> {
        self.record("boot").await;
        if self.fail_boot {
            return Err(SessionError::Boot("no capacity".into()));
        }
        Ok(SandboxHandle::new())
    }

    async fn mount(&self, _handle: &SandboxHandle, tree: &MountTree) -> SessionResult<()> {
        self.record("mount").await;
        self.mounts.lock().await.push(tree.clone());
        Ok(())
    }

    async fn spawn(
        &self,
        _handle: &SandboxHandle,
        command: &str,
        args: &[String],
    ) -> SessionResult<SpawnedProcess> {
        self.record(format!("spawn:{command} {}", args.join(" "))).await;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        for line in &self.install_lines {
            output_tx.send(line.clone()).unwrap();
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_code = self.install_exit;
        match self.install_gate.lock().await.take() {
            Some(gate) => {
                tokio::spawn(async move {
                    let _ = gate.await;
                    drop(output_tx);
                    let _ = exit_tx.send(exit_code);
                });
            }
            None => exit_tx.send(exit_code).unwrap(),
        }
        Ok(SpawnedProcess {
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn spawn_shell(&self, _handle: &SandboxHandle, shell: &str) -> SessionResult<ShellProcess> {
        self.record(format!("spawn_shell:{shell}")).await;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        *self.shell_output.lock().await = Some(output_tx);
        *self.shell_input.lock().await = Some(input_rx);
        Ok(ShellProcess {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn write_file(
        &self,
        _handle: &SandboxHandle,
        path: &str,
        contents: &str,
    ) -> SessionResult<()> {
        self.record("write_file").await;
        self.writes
            .lock()
            .await
            .push((path.to_string(), contents.to_string()));
        Ok(())
    }

    async fn remove_path(&self, _handle: &SandboxHandle, path: &str) -> SessionResult<()> {
        self.record("remove_path").await;
        self.removed.lock().await.push(path.to_string());
        Ok(())
    }

    async fn rename_path(&self, _handle: &SandboxHandle, from: &str, to: &str) -> SessionResult<()> {
        self.record("rename_path").await;
        self.renamed
            .lock()
            .await
            .push((from.to_string(), to.to_string()));
        Ok(())
    }

    async fn teardown(&self, _handle: &SandboxHandle) -> SessionResult<()> {
        self.record("teardown").await;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

pub struct MockBackend {
    tree: Tree,
    failing: Mutex<bool>,
    pub requests: Mutex<Vec<Recorded>>,
}

impl MockBackend {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            failing: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_failing(&self, failing: bool) {
        *self.failing.lock().await = failing;
    }

    pub async fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().await.clone()
    }

    async fn check(&self) -> PersistenceResult<()> {
        if *self.failing.lock().await {
            return Err(PersistenceError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for MockBackend {
    async fn update(&self, _project_id: &str, request: &UpdateRequest) -> PersistenceResult<()> {
        self.requests
            .lock()
            .await
            .push(Recorded::Update(request.clone()));
        self.check().await
    }

    async fn delete(&self, _project_id: &str, request: &DeleteRequest) -> PersistenceResult<()> {
        self.requests
            .lock()
            .await
            .push(Recorded::Delete(request.clone()));
        self.check().await
    }

    async fn load(&self, _project_id: &str) -> PersistenceResult<Tree> {
        self.check().await?;
        Ok(self.tree.clone())
    }
}

/// Receives events until one matches `predicate`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, predicate: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
