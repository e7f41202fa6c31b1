use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::errors::SessionResult;
use crate::tree::MountTree;

/// Output of a sandboxed process, in stream order.
pub type OutputStream = mpsc::UnboundedReceiver<String>;

/// Raw bytes written to an interactive process.
pub type InputWriter = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: Uuid,
    pub booted_at: DateTime<Utc>,
}

impl SandboxHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            booted_at: Utc::now(),
        }
    }
}

impl Default for SandboxHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A process spawned for its exit code, e.g. dependency installation.
pub struct SpawnedProcess {
    pub output: OutputStream,
    /// Resolves with the exit code. Dropped without a value if the process could not be awaited.
    pub exit: oneshot::Receiver<i32>,
}

/// A long-lived interactive shell.
pub struct ShellProcess {
    pub input: InputWriter,
    pub output: OutputStream,
}

/// A filesystem edit mirrored into a sandbox. Paths are `/`-joined display paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsChange {
    Write { path: String, contents: String },
    Remove { path: String },
    Rename { from: String, to: String },
    Mount(MountTree),
}

impl FsChange {
    pub async fn apply(&self, runtime: &dyn SandboxRuntime, handle: &SandboxHandle) -> SessionResult<()> {
        match self {
            FsChange::Write { path, contents } => runtime.write_file(handle, path, contents).await,
            FsChange::Remove { path } => runtime.remove_path(handle, path).await,
            FsChange::Rename { from, to } => runtime.rename_path(handle, from, to).await,
            FsChange::Mount(tree) => runtime.mount(handle, tree).await,
        }
    }
}

/// The isolated environment a session mounts the project into.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    async fn boot(&self) -> SessionResult<SandboxHandle>;
    async fn mount(&self, handle: &SandboxHandle, tree: &MountTree) -> SessionResult<()>;
    async fn spawn(
        &self,
        handle: &SandboxHandle,
        command: &str,
        args: &[String],
    ) -> SessionResult<SpawnedProcess>;
    async fn spawn_shell(&self, handle: &SandboxHandle, shell: &str) -> SessionResult<ShellProcess>;
    /// Writes a file addressed by its `/`-joined display path.
    async fn write_file(&self, handle: &SandboxHandle, path: &str, contents: &str)
        -> SessionResult<()>;
    /// Removes a file or directory tree. Missing paths are not an error.
    async fn remove_path(&self, handle: &SandboxHandle, path: &str) -> SessionResult<()>;
    async fn rename_path(&self, handle: &SandboxHandle, from: &str, to: &str) -> SessionResult<()>;
    /// Kills remaining processes and releases the environment.
    async fn teardown(&self, handle: &SandboxHandle) -> SessionResult<()>;
}
