//! Configuration loaded from a TOML file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::io::ssh_config::expand_tilde;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,

    #[serde(default)]
    pub rsync: RsyncConfig,

    /// Absolute paths (or glob patterns) to back up.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Patterns passed to rsync's `--exclude`.
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Weekday preferred as the representative of coarse retention
    /// periods (0 = Monday .. 6 = Sunday).
    #[serde(default = "default_weekday_full")]
    pub gffs_weekday_full: u32,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Directory holding the snapshots.
    pub path: String,

    /// SSH host of the target. Absent or empty means local.
    #[serde(default)]
    pub host: Option<String>,

    /// ssh client-config file consulted for connection settings.
    #[serde(default)]
    pub ssh_config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RsyncConfig {
    #[serde(default = "default_rsync_bin")]
    pub rsync_bin: String,

    #[serde(default = "default_ssh_bin")]
    pub ssh_bin: String,

    #[serde(default = "default_true")]
    pub acls: bool,

    #[serde(default = "default_true")]
    pub xattrs: bool,

    #[serde(default = "default_true")]
    pub prune_empty_dirs: bool,

    #[serde(default = "default_out_format")]
    pub out_format: Option<String>,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            rsync_bin: default_rsync_bin(),
            ssh_bin: default_ssh_bin(),
            acls: true,
            xattrs: true,
            prune_empty_dirs: true,
            out_format: default_out_format(),
        }
    }
}

// Default values
fn default_rsync_bin() -> String {
    "/usr/bin/rsync".to_string()
}

fn default_ssh_bin() -> String {
    "/usr/bin/ssh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_out_format() -> Option<String> {
    Some("%t %i %n".to_string())
}

fn default_weekday_full() -> u32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/snapsync/config.toml` (or the platform
    /// equivalent).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "snapsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The configured ssh config file with a leading `~/` expanded.
    pub fn ssh_config_file(&self) -> Option<PathBuf> {
        self.target
            .ssh_config_file
            .as_ref()
            .map(|p| expand_tilde(&p.to_string_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg: Config = toml::from_str(
            "[target]\n\
             path = \"/backups\"\n",
        )
        .unwrap();

        assert_eq!(cfg.target.path, "/backups");
        assert_eq!(cfg.target.host, None);
        assert_eq!(cfg.rsync.rsync_bin, "/usr/bin/rsync");
        assert_eq!(cfg.rsync.ssh_bin, "/usr/bin/ssh");
        assert!(cfg.rsync.acls);
        assert!(cfg.rsync.xattrs);
        assert!(cfg.rsync.prune_empty_dirs);
        assert_eq!(cfg.rsync.out_format.as_deref(), Some("%t %i %n"));
        assert!(cfg.includes.is_empty());
        assert!(cfg.excludes.is_empty());
        assert_eq!(cfg.gffs_weekday_full, 6);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn full_config_parses() {
        let cfg: Config = toml::from_str(
            "includes = [\"/home\", \"/etc\"]\n\
             excludes = [\"/home/*/.cache\"]\n\
             gffs_weekday_full = 0\n\
             log_level = \"debug\"\n\
             \n\
             [target]\n\
             path = \"/srv/backups\"\n\
             host = \"nas\"\n\
             ssh_config_file = \"/etc/ssh/ssh_config\"\n\
             \n\
             [rsync]\n\
             rsync_bin = \"/opt/bin/rsync\"\n\
             acls = false\n\
             xattrs = false\n",
        )
        .unwrap();

        assert_eq!(cfg.target.host.as_deref(), Some("nas"));
        assert_eq!(
            cfg.ssh_config_file(),
            Some(PathBuf::from("/etc/ssh/ssh_config"))
        );
        assert_eq!(cfg.rsync.rsync_bin, "/opt/bin/rsync");
        assert!(!cfg.rsync.acls);
        assert!(!cfg.rsync.xattrs);
        // Unset rsync keys still default inside a present section.
        assert!(cfg.rsync.prune_empty_dirs);
        assert_eq!(cfg.includes, vec!["/home", "/etc"]);
        assert_eq!(cfg.gffs_weekday_full, 0);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn missing_target_section_is_an_error() {
        assert!(toml::from_str::<Config>("log_level = \"info\"").is_err());
    }
}
