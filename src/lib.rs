//! Incremental snapshot backups built on rsync.
//!
//! Each run produces a point-in-time snapshot directory named after its
//! creation instant. Unchanged files are hardlinked against the previous
//! valid snapshot via `--link-dest`, so every snapshot is a complete tree
//! while only changed data occupies new space. Targets are local
//! directories or SSH hosts reached over SFTP.

pub mod backup;
pub mod config;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod retention;
pub mod rsync;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
