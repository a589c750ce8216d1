//! snapsync - Incremental rsync snapshot backups.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use snapsync::retention::GffsTiers;
use snapsync::rsync::Status;
use snapsync::{logger, ops, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new snapshot of the configured includes
    Backup {
        /// Show what would be transferred without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore files from a snapshot
    Restore {
        /// Paths to restore; the whole snapshot when omitted
        items: Vec<String>,

        /// Snapshot to restore from; the most recent when omitted
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to restore into; the original location when omitted
        #[arg(short, long)]
        target: Option<String>,

        /// Show what would be transferred without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// List all snapshots on the target
    List,

    /// Show details of one snapshot
    Info {
        /// Snapshot name; the most recent when omitted
        name: Option<String>,
    },

    /// Mark snapshots as valid or invalid
    Validate {
        /// Snapshot names
        #[arg(required = true)]
        names: Vec<String>,

        /// Mark as invalid instead of valid
        #[arg(long)]
        invalid: bool,
    },

    /// Remove the named snapshots
    Remove {
        /// Snapshot names
        #[arg(required = true)]
        names: Vec<String>,

        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all but the most recent snapshots
    RemoveButKeep {
        /// Number of snapshots to keep
        keep: usize,

        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove snapshots older than a given age (e.g. 30d, 2w)
    RemoveOlderThan {
        /// Age in <count><unit> form with units s, m, h, d, w
        duration: String,

        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all snapshots marked invalid
    RemoveInvalid {
        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Thin out history, keeping daily, weekly, monthly and yearly snapshots
    RemoveGffs {
        /// Daily snapshots to keep
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Weekly snapshots to keep
        #[arg(long, default_value_t = 4)]
        weeks: u32,

        /// Monthly snapshots to keep
        #[arg(long, default_value_t = 12)]
        months: u32,

        /// Yearly snapshots to keep
        #[arg(long, default_value_t = 3)]
        years: u32,

        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },
}

/// Surface an unclean transfer as a process failure.
fn report(status: Status) -> Result<()> {
    if status.is_complete() {
        Ok(())
    } else {
        bail!("rsync failed: {status} (exit code {})", status.exit_code());
    }
}

fn run(args: Args, config: Config) -> Result<()> {
    let mut pool = snapsync::io::EndpointPool::new();

    match args.command {
        Command::Backup { dry_run } => {
            let status = ops::create_backup(&mut pool, &config, dry_run)?;
            report(status)?;
        }
        Command::Restore {
            items,
            name,
            target,
            dry_run,
        } => {
            let status = ops::restore_backup(
                &mut pool,
                &config,
                name.as_deref(),
                &items,
                target.as_deref(),
                dry_run,
            )?;
            report(status)?;
        }
        Command::List => {
            for backup in ops::list_backups(&mut pool, &config)? {
                let marker = if backup.is_valid()? { " " } else { "!" };
                println!("{marker} {} ({})", backup.name(), backup.name_pretty());
            }
        }
        Command::Info { name } => {
            let backup = ops::find_backup(&mut pool, &config, name.as_deref())?;
            let info = backup.info()?;

            println!("Name:     {}", backup.name());
            println!("Created:  {}", backup.name_pretty());
            println!("Valid:    {}", info.valid);
            println!("Size:     {}", ops::bytes2human(backup.bytes()?));
            if let Some(started) = &info.backup_started_at {
                println!("Started:  {started}");
            }
            if let Some(finished) = &info.backup_finished_at {
                println!("Finished: {finished}");
            }
            for restored in &info.restored_at {
                println!("Restored: {restored}");
            }
        }
        Command::Validate { names, invalid } => {
            ops::set_valid(&mut pool, &config, &names, !invalid)?;
        }
        Command::Remove { names, dry_run } => {
            ops::remove_backups(&mut pool, &config, &names, dry_run)?;
        }
        Command::RemoveButKeep { keep, dry_run } => {
            ops::remove_but_keep(&mut pool, &config, keep, dry_run)?;
        }
        Command::RemoveOlderThan { duration, dry_run } => {
            ops::remove_older_than(&mut pool, &config, &duration, dry_run)?;
        }
        Command::RemoveInvalid { dry_run } => {
            ops::remove_invalid(&mut pool, &config, dry_run)?;
        }
        Command::RemoveGffs {
            days,
            weeks,
            months,
            years,
            dry_run,
        } => {
            let tiers = GffsTiers {
                days,
                weeks,
                months,
                years,
            };
            ops::remove_gffs(&mut pool, &config, tiers, dry_run)?;
        }
    }

    pool.close_all();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_path = args
        .config
        .clone()
        .or_else(Config::default_path)
        .ok_or_else(|| anyhow!("could not determine a config file location"))?;
    let config = Config::from_file(&config_path)
        .with_context(|| "pass --config or create the default config file")?;

    // Initialize logging
    logger::init(args.log_level.as_deref(), &config.log_level)?;

    tracing::info!(
        "Starting snapsync v{} (target: {})",
        env!("CARGO_PKG_VERSION"),
        config.target.path
    );

    run(args, config)
}
