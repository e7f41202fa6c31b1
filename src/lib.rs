pub mod errors;
pub mod local;
pub mod mutation;
pub mod path_codec;
pub mod persistence;
pub mod process_state;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod timing;
pub mod tree;
pub mod workspace;

pub use errors::{PersistenceError, SessionError, TreeError};
pub use local::LocalRuntime;
pub use mutation::{create_entry, delete_entry, rename_entry, update_contents, Mutation, SyncInstruction};
pub use path_codec::{combine, decode, encode, sandbox_path, EncodedName, LogicalPath, NodeKind, SandboxPath};
pub use persistence::{ChangeTracker, HttpBackend, PersistenceBackend};
pub use process_state::{OutputPatterns, ProcessEvent, ProcessState, ProcessStateMachine, TestOutcome};
pub use runtime::{SandboxHandle, SandboxRuntime};
pub use session::{SandboxSession, SessionEvent, SessionState};
pub use settings::Settings;
pub use tree::{Directory, EntryKey, Tree};
pub use workspace::{SyncStatus, Workspace};

pub const DEFAULT_DATA_DIR: &str = "playground-sandboxes";
