use thiserror::Error;

/// Structural edit failures. These are synchronous and always leave the tree untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("name '{0}' cannot be represented in the tree")]
    InvalidName(String),
    #[error("an entry named '{0}' already exists")]
    DuplicateName(String),
    #[error("no entry at '{0}'")]
    NotFound(String),
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
    #[error("'{0}' is not a file")]
    NotAFile(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("sandbox session already booted")]
    AlreadyBooted,
    #[error("sandbox failed to boot: {0}")]
    Boot(String),
    #[error("dependency installation failed with exit code {exit_code}")]
    InstallationFailed { exit_code: i32 },
    #[error("sandbox session is not ready")]
    NotReady,
    #[error("sandbox session failed: {0}")]
    Failed(String),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("persistence request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid project tree: {0}")]
    Decode(String),
}

pub type TreeResult<T> = Result<T, TreeError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;
