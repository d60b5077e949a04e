//! CLI Module
//! Command-line surface for backup, versioning, restore and inventory

pub mod formatter;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use super::version::IncrementKind;

#[derive(Parser, Debug)]
#[command(name = "bronco-backup")]
#[command(author = "Bronco Controls Team")]
#[command(version)]
#[command(about = "ESP32-S3 device backup, versioning and release manager", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Serial port the device is connected to
    #[arg(long, global = true, default_value = "COM5")]
    pub port: String,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 460800)]
    pub baud: u32,

    /// Skip publishing artifacts to the remote store
    #[arg(long, global = true)]
    pub no_upload: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Version increment kind as a CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Full hardware backup, N.0.0
    Major,
    /// Version snapshot, x.N.0
    Minor,
    /// Version snapshot, x.x.N
    Build,
}

impl From<KindArg> for IncrementKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Major => IncrementKind::Major,
            KindArg::Minor => IncrementKind::Minor,
            KindArg::Build => IncrementKind::Build,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a backup of the chosen increment kind
    Backup {
        /// Which version component to bump; major captures the whole device
        #[arg(short, long, value_enum, default_value = "build")]
        kind: KindArg,

        /// Flash the freshly built image to the device (best-effort)
        #[arg(long)]
        flash: bool,
    },

    /// Full hardware backup of every flash region (major version bump)
    FullBackup,

    /// Build and publish a version snapshot (build number bump)
    Version {
        /// Flash the freshly built image to the device (best-effort)
        #[arg(long)]
        flash: bool,
    },

    /// Erase the device and replay a backup
    Restore {
        /// Backup folder to restore from (defaults to the newest local full backup)
        #[arg(short, long)]
        backup: Option<PathBuf>,

        /// Published archive to restore, by version (e.g. "2.0.0")
        #[arg(long, conflicts_with = "backup")]
        remote: Option<String>,
    },

    /// List local backups
    List,

    /// List local and published backups together
    ListRemote,

    /// Full backup-erase-restore cycle against the connected device
    Test,
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
