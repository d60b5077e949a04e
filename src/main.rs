//! Bronco Controls CLI - entry point
//!
//! Dispatches the backup/restore/versioning subcommands; any unrecoverable
//! step reports its error chain and exits non-zero.

use anyhow::Context;
use bronco_backup::engine::backup::{
    BackupEngine, BackupKind, BackupRecord, ReleaseOptions, BACKUPS_DIR,
};
use bronco_backup::engine::cli::formatter::{format_size, CliFormatter};
use bronco_backup::engine::cli::{Cli, Commands};
use bronco_backup::engine::inventory::{self, InventoryEntry};
use bronco_backup::engine::publisher::{self, Publisher, ReleaseOutcome};
use bronco_backup::engine::restore::RestoreEngine;
use bronco_backup::engine::tools::{ShellGateway, ToolGateway};
use bronco_backup::engine::version::{IncrementKind, VersionStore};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        CliFormatter::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let project_dir = cli.get_project_dir();
    let gateway = ShellGateway::new(&cli.port, cli.baud);

    match &cli.command {
        Commands::Backup { kind, flash } => {
            cmd_backup(&cli, &project_dir, &gateway, (*kind).into(), *flash)
        }
        Commands::FullBackup => cmd_backup(&cli, &project_dir, &gateway, IncrementKind::Major, false),
        Commands::Version { flash } => {
            cmd_backup(&cli, &project_dir, &gateway, IncrementKind::Build, *flash)
        }
        Commands::Restore { backup, remote } => {
            cmd_restore(&project_dir, &gateway, backup.clone(), remote.clone())
        }
        Commands::List => cmd_list(&project_dir, false),
        Commands::ListRemote => cmd_list(&project_dir, true),
        Commands::Test => cmd_test(&cli, &project_dir, &gateway),
    }
}

fn cmd_backup(
    cli: &Cli,
    project_dir: &Path,
    gateway: &ShellGateway,
    kind: IncrementKind,
    flash: bool,
) -> anyhow::Result<()> {
    let mut versions = VersionStore::load(project_dir);
    let engine = BackupEngine::new(project_dir, gateway, &cli.port, cli.baud);

    let record = match kind {
        IncrementKind::Major => {
            CliFormatter::header("Full hardware backup");
            CliFormatter::kv("Port", &cli.port);
            engine.full_backup(&mut versions).context("full backup failed")?
        }
        other => {
            CliFormatter::header("Version snapshot");
            engine
                .release_backup(&mut versions, other, ReleaseOptions { flash_device: flash })
                .context("version snapshot failed")?
        }
    };
    CliFormatter::success(&format!(
        "v{} created at {}",
        record.version,
        record.folder.display()
    ));

    if cli.no_upload {
        CliFormatter::info("upload skipped (--no-upload)");
        return Ok(());
    }
    publish(project_dir, &record);
    Ok(())
}

/// Publish a finished backup. The uploads are independent: each failure is
/// reported and the remaining artifacts are still attempted.
fn publish(project_dir: &Path, record: &BackupRecord) {
    let token = publisher::resolve_token();
    if token.is_none() {
        CliFormatter::warning("no GitHub credential found; publishing will be skipped");
    }
    let publisher = Publisher::new(token);

    if let Err(e) = publisher.upload_binary(&record.folder, record.version) {
        CliFormatter::warning(&format!("binary upload failed: {e}"));
    }

    if record.kind == BackupKind::FullHardware {
        if let Err(e) = publisher.upload_archive(&record.folder, record.version, record.kind) {
            CliFormatter::warning(&format!("archive upload failed: {e}"));
        }
        match publisher.create_release(project_dir, &record.folder, record.version) {
            Ok(ReleaseOutcome::Created) => {
                CliFormatter::success(&format!("release v{} created", record.version))
            }
            Ok(ReleaseOutcome::AlreadyPublished) => {
                CliFormatter::info(&format!("release v{} already published", record.version))
            }
            Err(e) => CliFormatter::warning(&format!("release creation failed: {e}")),
        }
    }
}

fn cmd_restore(
    project_dir: &Path,
    gateway: &ShellGateway,
    backup: Option<PathBuf>,
    remote: Option<String>,
) -> anyhow::Result<()> {
    let engine = RestoreEngine::new(gateway);

    if let Some(wanted) = remote {
        let token = publisher::resolve_token();
        let publisher = Publisher::new(token.clone());
        let files = publisher
            .list_remote_files()
            .context("failed to fetch the remote listing")?;
        let entries = inventory::remote_entries(&files);
        let wanted_version = wanted.trim_start_matches('v');
        let entry = entries
            .iter()
            .find(|e| e.version.to_string() == wanted_version)
            .with_context(|| format!("no published full backup matching {wanted}"))?;

        CliFormatter::header("Remote restore");
        CliFormatter::kv("Version", &format!("v{}", entry.version));
        engine
            .restore_remote(&entry.locator, token.as_deref())
            .context("remote restore failed")?;
    } else {
        let folder = match backup {
            Some(folder) => folder,
            None => newest_local_full(project_dir)?,
        };
        CliFormatter::header("Restore");
        CliFormatter::kv("Backup", &folder.display().to_string());
        engine.restore_local(&folder).context("restore failed")?;
    }

    CliFormatter::success("device restored, it will reboot automatically");
    Ok(())
}

fn newest_local_full(project_dir: &Path) -> anyhow::Result<PathBuf> {
    let mut entries: Vec<InventoryEntry> = inventory::list_local(&project_dir.join(BACKUPS_DIR))?
        .into_iter()
        .filter(|e| e.kind == BackupKind::FullHardware)
        .collect();
    entries.sort_by(|a, b| b.version.cmp(&a.version));
    let newest = entries.first().context("no local full backups available")?;
    CliFormatter::info(&format!("using latest backup v{}", newest.version));
    Ok(PathBuf::from(&newest.locator))
}

fn cmd_list(project_dir: &Path, include_remote: bool) -> anyhow::Result<()> {
    let local = inventory::list_local(&project_dir.join(BACKUPS_DIR))?;
    let remote = if include_remote {
        let publisher = Publisher::new(publisher::resolve_token());
        match publisher.list_remote_files() {
            Ok(files) => inventory::remote_entries(&files),
            Err(e) => {
                // A broken catalog fetch must not hide the local backups.
                CliFormatter::warning(&format!("remote listing unavailable: {e}"));
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let entries = inventory::merge_entries(local, remote);
    if entries.is_empty() {
        CliFormatter::info("no backups found");
        return Ok(());
    }

    CliFormatter::header(&format!("Available backups ({})", entries.len()));
    for (idx, entry) in entries.iter().enumerate() {
        CliFormatter::numbered_item(
            idx + 1,
            &format!(
                "v{} - {} [{}] ({})",
                entry.version,
                entry.kind,
                entry.source,
                format_size(entry.size)
            ),
        );
        CliFormatter::item(&entry.locator);
    }
    Ok(())
}

fn cmd_test(cli: &Cli, project_dir: &Path, gateway: &ShellGateway) -> anyhow::Result<()> {
    CliFormatter::header("Full test cycle");
    let mut versions = VersionStore::load(project_dir);
    let engine = BackupEngine::new(project_dir, gateway, &cli.port, cli.baud);

    CliFormatter::info("[1/3] creating full backup");
    let record = engine.full_backup(&mut versions).context("test backup failed")?;

    CliFormatter::info("[2/3] erasing device");
    gateway.erase_flash().context("test erase failed")?;

    CliFormatter::info("[3/3] restoring from the new backup");
    RestoreEngine::new(gateway)
        .restore_local(&record.folder)
        .context("test restore failed")?;

    CliFormatter::success("full test cycle completed, device state verified");
    Ok(())
}
