//! High-level operations behind the CLI subcommands.
//!
//! Each function wires a loaded [`Config`] to the endpoint pool, the
//! rsync driver and the snapshot layer, and logs what it decided to do.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};

use crate::backup::{Backup, NAME_FORMAT};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::{Endpoint, EndpointPool};
use crate::retention;
use crate::rsync::{Rsync, Status};

pub fn configured_endpoint(pool: &mut EndpointPool, cfg: &Config) -> Result<Arc<Endpoint>> {
    pool.get(cfg.target.host.as_deref(), cfg.ssh_config_file().as_deref())
}

pub fn configured_rsync(cfg: &Config) -> Rsync {
    let mut rsync = Rsync::default();
    rsync.rsync_bin = cfg.rsync.rsync_bin.clone();
    rsync.ssh_bin = cfg.rsync.ssh_bin.clone();
    rsync.ssh_config_file = cfg.ssh_config_file();
    rsync.acls = cfg.rsync.acls;
    rsync.xattrs = cfg.rsync.xattrs;
    rsync.prune_empty_dirs = cfg.rsync.prune_empty_dirs;
    rsync.out_format = cfg.rsync.out_format.clone();
    rsync
}

/// All snapshots on the target, oldest first.
pub fn list_backups(pool: &mut EndpointPool, cfg: &Config) -> Result<Vec<Backup>> {
    let io = configured_endpoint(pool, cfg)?;
    Backup::all_backups(&io, &cfg.target.path, true, true)
}

/// Look up one snapshot by name, or the most recent one when `name` is
/// omitted.
pub fn find_backup(pool: &mut EndpointPool, cfg: &Config, name: Option<&str>) -> Result<Backup> {
    let io = configured_endpoint(pool, cfg)?;
    match name {
        Some(name) => Backup::from_name(io, &cfg.target.path, name),
        None => Backup::latest(&io, &cfg.target.path, true, true)?.ok_or(Error::BackupNotFound),
    }
}

/// Create a new snapshot of the configured includes.
pub fn create_backup(pool: &mut EndpointPool, cfg: &Config, dry_run: bool) -> Result<Status> {
    let io = configured_endpoint(pool, cfg)?;
    let rsync = configured_rsync(cfg);
    let backup = Backup::new(io, &cfg.target.path);
    let status = backup.create(&rsync, &cfg.includes, &cfg.excludes, dry_run)?;
    info!(name = %backup.name(), %status, "Backup finished");
    Ok(status)
}

/// Restore `items` from a snapshot into `target`.
pub fn restore_backup(
    pool: &mut EndpointPool,
    cfg: &Config,
    name: Option<&str>,
    items: &[String],
    target: Option<&str>,
    dry_run: bool,
) -> Result<Status> {
    let backup = find_backup(pool, cfg, name)?;
    let rsync = configured_rsync(cfg);
    let status = backup.restore(&rsync, items, target, dry_run)?;
    info!(name = %backup.name(), %status, "Restore finished");
    Ok(status)
}

/// Remove the named snapshots. A name that does not resolve is reported
/// and skipped so one stale argument cannot abort a cleanup run.
pub fn remove_backups(
    pool: &mut EndpointPool,
    cfg: &Config,
    names: &[String],
    dry_run: bool,
) -> Result<()> {
    let io = configured_endpoint(pool, cfg)?;
    for name in names {
        let backup = match Backup::from_name(Arc::clone(&io), &cfg.target.path, name) {
            Ok(backup) => backup,
            Err(Error::BackupNotFound) => {
                warn!(name = %name, "No such backup, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        if dry_run {
            info!(name = %backup.name(), "Would remove backup");
        } else {
            backup.remove()?;
        }
    }
    Ok(())
}

fn remove_instants(
    pool: &mut EndpointPool,
    cfg: &Config,
    instants: &[NaiveDateTime],
    dry_run: bool,
) -> Result<()> {
    let names: Vec<String> = instants
        .iter()
        .map(|dt| dt.format(NAME_FORMAT).to_string())
        .collect();
    remove_backups(pool, cfg, &names, dry_run)
}

fn instants_of(backups: &[Backup]) -> Vec<NaiveDateTime> {
    backups.iter().map(Backup::datetime).collect()
}

/// Remove all but the `keep` most recent snapshots.
pub fn remove_but_keep(
    pool: &mut EndpointPool,
    cfg: &Config,
    keep: usize,
    dry_run: bool,
) -> Result<()> {
    let backups = list_backups(pool, cfg)?;
    let remove = retention::keep_last_n(&instants_of(&backups), keep);
    info!(total = backups.len(), removing = remove.len(), "Pruning to last {keep}");
    remove_instants(pool, cfg, &remove, dry_run)
}

/// Remove snapshots created at or before `duration` ago. `duration` uses
/// the `<count><unit>` form, for example `2w`.
pub fn remove_older_than(
    pool: &mut EndpointPool,
    cfg: &Config,
    duration: &str,
    dry_run: bool,
) -> Result<()> {
    let duration = retention::parse_duration(duration)?;
    let backups = list_backups(pool, cfg)?;
    let now = Local::now().naive_local();
    let remove = retention::older_than(&instants_of(&backups), duration, now);
    info!(total = backups.len(), removing = remove.len(), "Pruning by age");
    remove_instants(pool, cfg, &remove, dry_run)
}

/// Remove all snapshots whose last transfer did not finish cleanly.
pub fn remove_invalid(pool: &mut EndpointPool, cfg: &Config, dry_run: bool) -> Result<()> {
    let backups = list_backups(pool, cfg)?;
    let mut flagged = Vec::with_capacity(backups.len());
    for backup in &backups {
        flagged.push((backup.datetime(), backup.is_valid()?));
    }
    let remove = retention::invalid_only(&flagged);
    info!(total = backups.len(), removing = remove.len(), "Pruning invalid backups");
    remove_instants(pool, cfg, &remove, dry_run)
}

/// Thin out the history with a grandfather-father-son rotation.
pub fn remove_gffs(
    pool: &mut EndpointPool,
    cfg: &Config,
    tiers: retention::GffsTiers,
    dry_run: bool,
) -> Result<()> {
    let backups = list_backups(pool, cfg)?;
    let remove = retention::gffs(&instants_of(&backups), tiers, cfg.gffs_weekday_full);
    info!(total = backups.len(), removing = remove.len(), "Rotating backups");
    remove_instants(pool, cfg, &remove, dry_run)
}

/// Mark the named snapshots as valid or invalid.
pub fn set_valid(
    pool: &mut EndpointPool,
    cfg: &Config,
    names: &[String],
    valid: bool,
) -> Result<()> {
    let io = configured_endpoint(pool, cfg)?;
    for name in names {
        let backup = Backup::from_name(Arc::clone(&io), &cfg.target.path, name)?;
        backup.set_valid(valid)?;
        info!(name = %backup.name(), valid, "Validity updated");
    }
    Ok(())
}

/// Render a byte count with a binary-prefix unit.
pub fn bytes2human(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
