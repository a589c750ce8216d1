//! Error taxonomy shared across the backup core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("backup does not exist")]
    BackupNotFound,

    #[error("backup already exists")]
    BackupAlreadyExists,

    #[error("unknown rsync exit code {0}")]
    InvalidExitCode(i32),

    #[error("an rsync process is already running")]
    AlreadyRunning,

    #[error("not an absolute path: {0:?}")]
    InvalidPath(String),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH transport failure: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("could not connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("invalid backup metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Error {
    /// True when the underlying failure is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Ssh(e) => matches!(e.code(), ssh2::ErrorCode::SFTP(2)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
