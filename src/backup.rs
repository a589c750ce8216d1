//! Snapshot lifecycle: creation, restore, enumeration and removal.
//!
//! A backup is a directory named after its creation instant in
//! `%Y%m%d%H%M%S` form, containing a `data/` payload tree and a `.info`
//! JSON sidecar with validity and bookkeeping metadata. Lexical order of
//! the names equals chronological order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::io::Endpoint;
use crate::rsync::{Rsync, Status, SyncPath};

pub const NAME_FORMAT: &str = "%Y%m%d%H%M%S";
pub const PRETTY_FORMAT: &str = "%a %d, %b %Y - %H:%M:%S";

const DATA_DIR: &str = "data";
const INFO_FILE: &str = ".info";

fn pretty_instant(dt: NaiveDateTime) -> String {
    dt.format(PRETTY_FORMAT).to_string()
}

/// The current instant in the form the `.info` sidecar stores.
fn pretty_now() -> String {
    pretty_instant(Local::now().naive_local())
}

fn join(base: &str, child: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{child}")
    } else {
        format!("{base}/{child}")
    }
}

/// Contents of the `.info` sidecar.
///
/// Unknown fields are preserved-by-omission: absent fields deserialize to
/// their defaults so sidecars written by older versions stay readable.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    #[serde(default)]
    pub valid: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_finished_at: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restored_at: Vec<String>,
}

/// One snapshot rooted under a backup directory on an [`Endpoint`].
pub struct Backup {
    io: Arc<Endpoint>,
    root: String,
    name: String,
    datetime: NaiveDateTime,
}

impl Backup {
    fn from_parts(io: Arc<Endpoint>, root: &str, name: &str) -> Result<Self> {
        let datetime = NaiveDateTime::parse_from_str(name, NAME_FORMAT)
            .map_err(|_| Error::BackupNotFound)?;
        Ok(Self {
            io,
            root: root.to_owned(),
            name: name.to_owned(),
            datetime,
        })
    }

    /// A handle for a new snapshot named after the current instant.
    pub fn new(io: Arc<Endpoint>, root: &str) -> Self {
        let datetime = Local::now().naive_local();
        Self {
            io,
            root: root.to_owned(),
            name: datetime.format(NAME_FORMAT).to_string(),
            datetime,
        }
    }

    /// A handle for an existing snapshot. Fails with
    /// [`Error::BackupNotFound`] when `name` is not a valid snapshot name
    /// or no such directory exists.
    pub fn from_name(io: Arc<Endpoint>, root: &str, name: &str) -> Result<Self> {
        let backup = Self::from_parts(io, root, name)?;
        if !backup.exists()? {
            return Err(Error::BackupNotFound);
        }
        Ok(backup)
    }

    /// All snapshots under `root`, sorted ascending by creation time.
    /// Stray directory entries that are not snapshot names are skipped.
    pub fn all_backups(
        io: &Arc<Endpoint>,
        root: &str,
        include_valid: bool,
        include_invalid: bool,
    ) -> Result<Vec<Backup>> {
        let names = match io.list_dir(root) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut backups = Vec::new();
        for name in names {
            let backup = match Self::from_parts(Arc::clone(io), root, &name) {
                Ok(backup) => backup,
                Err(_) => continue,
            };
            if include_valid && include_invalid {
                backups.push(backup);
            } else if backup.is_valid()? == include_valid && include_valid != include_invalid {
                backups.push(backup);
            }
        }
        backups.sort();
        Ok(backups)
    }

    /// The most recent snapshot under `root`, if any.
    pub fn latest(
        io: &Arc<Endpoint>,
        root: &str,
        include_valid: bool,
        include_invalid: bool,
    ) -> Result<Option<Backup>> {
        Ok(Self::all_backups(io, root, include_valid, include_invalid)?.pop())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.datetime
    }

    /// Human-readable creation instant.
    pub fn name_pretty(&self) -> String {
        self.datetime.format(PRETTY_FORMAT).to_string()
    }

    pub fn backup_dir(&self) -> String {
        join(&self.root, &self.name)
    }

    pub fn data_dir(&self) -> String {
        join(&self.backup_dir(), DATA_DIR)
    }

    fn info_path(&self) -> String {
        join(&self.backup_dir(), INFO_FILE)
    }

    pub fn exists(&self) -> Result<bool> {
        self.io.exists(&self.backup_dir())
    }

    /// Read the sidecar. A missing sidecar reads as all-defaults, so a
    /// snapshot interrupted before bookkeeping started counts as invalid.
    pub fn info(&self) -> Result<BackupInfo> {
        match self.io.read(&self.info_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_not_found() => Ok(BackupInfo::default()),
            Err(e) => Err(e),
        }
    }

    fn write_info(&self, info: &BackupInfo) -> Result<()> {
        let data = serde_json::to_vec_pretty(info)?;
        self.io.write(&self.info_path(), &data)
    }

    fn update_info(&self, apply: impl FnOnce(&mut BackupInfo)) -> Result<()> {
        let mut info = self.info()?;
        apply(&mut info);
        self.write_info(&info)
    }

    pub fn is_valid(&self) -> Result<bool> {
        Ok(self.info()?.valid)
    }

    pub fn set_valid(&self, valid: bool) -> Result<()> {
        self.update_info(|info| info.valid = valid)
    }

    /// Payload size in bytes, measured once and cached in the sidecar.
    pub fn bytes(&self) -> Result<u64> {
        if let Some(bytes) = self.info()?.bytes {
            return Ok(bytes);
        }
        let bytes = self.io.calculate_size(&self.data_dir())?;
        self.update_info(|info| info.bytes = Some(bytes))?;
        Ok(bytes)
    }

    /// Transfer `includes` into this snapshot's payload tree, hardlinking
    /// unchanged files against the latest valid snapshot.
    ///
    /// The snapshot is marked valid only on a fully clean transfer; a
    /// partial transfer leaves it invalid so the next run will not
    /// hardlink against it.
    pub fn create(
        &self,
        rsync: &Rsync,
        includes: &[String],
        excludes: &[String],
        dry_run: bool,
    ) -> Result<Status> {
        if self.exists()? {
            return Err(Error::BackupAlreadyExists);
        }

        let link_dest = Self::latest(&self.io, &self.root, true, false)?.map(|b| b.data_dir());

        if !dry_run {
            self.io.make_dirs(&self.data_dir())?;
            self.update_info(|info| {
                info.backup_started_at = Some(pretty_now());
            })?;
        }

        info!(name = %self.name, "Creating backup");
        debug!(?link_dest, "Hardlink base");

        let target = SyncPath::new(self.data_dir(), self.io.host());
        let includes: Vec<SyncPath> = includes.iter().map(SyncPath::local).collect();

        let status = rsync.sync(&target, &includes, excludes, link_dest.as_deref(), dry_run)?;

        if !dry_run {
            self.update_info(|info| {
                info.backup_finished_at = Some(pretty_now());
            })?;
            if self.info()?.bytes.is_none() {
                let bytes = self.io.calculate_size(&self.data_dir())?;
                self.update_info(|info| info.bytes = Some(bytes))?;
            }
            if status.is_success() {
                self.set_valid(true)?;
            }
        }

        Ok(status)
    }

    /// Restore `items` from this snapshot into `target`, or the whole
    /// payload into `/` when both are omitted.
    ///
    /// Each item is rewritten relative to the payload root so rsync's
    /// `--relative` reconstructs the original hierarchy below `target`.
    pub fn restore(
        &self,
        rsync: &Rsync,
        items: &[String],
        target: Option<&str>,
        dry_run: bool,
    ) -> Result<Status> {
        if !self.exists()? {
            return Err(Error::BackupNotFound);
        }

        let data_dir = self.data_dir();
        let items: Vec<String> = if items.is_empty() {
            vec![data_dir.clone()]
        } else {
            items.to_vec()
        };

        let sources: Vec<SyncPath> = items
            .iter()
            .map(|item| {
                let path = if *item == data_dir {
                    format!("{data_dir}/./")
                } else {
                    format!("{data_dir}/./{}", item.trim_start_matches('/'))
                };
                SyncPath::new(path, self.io.host())
            })
            .collect();

        let target = SyncPath::local(target.unwrap_or("/"));

        info!(name = %self.name, target = %target, "Restoring backup");

        let status = rsync.sync(&target, &sources, &[], None, dry_run)?;

        if !dry_run {
            self.update_info(|info| {
                info.restored_at.push(pretty_now());
            })?;
        }

        Ok(status)
    }

    /// Delete this snapshot's directory tree.
    pub fn remove(&self) -> Result<()> {
        if !self.exists()? {
            return Err(Error::BackupNotFound);
        }
        info!(name = %self.name, "Removing backup");
        self.io.remove_tree(&self.backup_dir())
    }
}

impl PartialEq for Backup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Backup {}

impl PartialOrd for Backup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Backup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
