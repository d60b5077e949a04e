//! Restore Engine
//!
//! Replays a backup onto the device: one whole-flash erase, then every
//! recorded region written back at its original offset, in the order the
//! capture recorded. A restore is never resumed mid-sequence; partial writes
//! over stale content would leave an inconsistent hybrid state, so a failed
//! restore is retried from the erase.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::backup::{BackupMetadata, BACKUP_METADATA_FILE};
use super::tools::{ToolError, ToolGateway};

/// Pause after the erase before the first write, letting the chip settle.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Remote download budget.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("restore aborted at region {region} ({completed} of {total} written): {source}; flash is partially written, retry from a full erase")]
    PartialRestore {
        region: String,
        completed: usize,
        total: usize,
        source: ToolError,
    },
    #[error("download failed: {0}")]
    Download(String),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct RestoreEngine<'a, G: ToolGateway> {
    gateway: &'a G,
}

impl<'a, G: ToolGateway> RestoreEngine<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    /// Restore the device from a local backup folder.
    pub fn restore_local(&self, folder: &Path) -> Result<(), RestoreError> {
        let metadata = load_metadata(folder)?;

        tracing::info!(
            version = %metadata.version,
            date = %metadata.backup_date,
            "restoring from backup"
        );

        // Step 1: wipe everything. Writing over stale content is never safe.
        tracing::info!("erasing device flash");
        self.gateway.erase_flash()?;
        std::thread::sleep(SETTLE_DELAY);

        // Step 2: replay each region in its recorded order.
        let total = metadata.regions.len();
        for (completed, (name, capture)) in metadata.regions.iter().enumerate() {
            let image = folder.join(&capture.file);
            if !image.exists() {
                return Err(RestoreError::InvalidBackup(format!(
                    "missing region file {}",
                    capture.file
                )));
            }
            let offset = capture.offset_value().ok_or_else(|| {
                RestoreError::InvalidBackup(format!("bad offset {:?} for region {name}", capture.offset))
            })?;

            tracing::info!(step = completed + 1, total, region = name, offset = %capture.offset, "writing region");
            self.gateway
                .write_region(offset, &image)
                .map_err(|source| RestoreError::PartialRestore {
                    region: name.to_string(),
                    completed,
                    total,
                    source,
                })?;
        }

        tracing::info!("device restored, it will reboot automatically");
        Ok(())
    }

    /// Download a published backup archive and restore from it.
    ///
    /// The archive and its extraction directory are scoped temporaries,
    /// deleted on every exit path.
    pub fn restore_remote(&self, url: &str, token: Option<&str>) -> Result<(), RestoreError> {
        let staging = tempfile::tempdir()?;
        let archive_path = staging.path().join("backup.zip");

        tracing::info!(%url, "downloading backup archive");
        download(url, token, &archive_path)?;

        let extract_dir = staging.path().join("extracted");
        fs::create_dir_all(&extract_dir)?;
        let archive_file = fs::File::open(&archive_path)?;
        zip::ZipArchive::new(archive_file)?.extract(&extract_dir)?;

        let folder = single_top_level_dir(&extract_dir)?;
        self.restore_local(&folder)
        // `staging` drops here, removing the archive and extraction tree.
    }
}

/// Load and validate the metadata document of a backup folder.
fn load_metadata(folder: &Path) -> Result<BackupMetadata, RestoreError> {
    if !folder.exists() {
        return Err(RestoreError::InvalidBackup(format!(
            "backup folder not found: {}",
            folder.display()
        )));
    }
    let metadata_path = folder.join(BACKUP_METADATA_FILE);
    let content = fs::read_to_string(&metadata_path).map_err(|_| {
        RestoreError::InvalidBackup(format!("metadata file not found in {}", folder.display()))
    })?;
    let metadata: BackupMetadata = serde_json::from_str(&content)
        .map_err(|e| RestoreError::InvalidBackup(format!("corrupt metadata: {e}")))?;
    if metadata.regions.is_empty() {
        return Err(RestoreError::InvalidBackup("metadata lists no regions".to_string()));
    }
    Ok(metadata)
}

fn download(url: &str, token: Option<&str>, dest: &Path) -> Result<(), RestoreError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent("bronco-backup")
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| RestoreError::Download(e.to_string()))?;

    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
    }
    let mut response = request.send().map_err(|e| RestoreError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(RestoreError::Download(format!("HTTP {}", response.status())));
    }

    let mut file = fs::File::create(dest)?;
    io::copy(&mut response, &mut file).map_err(|e| RestoreError::Download(e.to_string()))?;
    Ok(())
}

/// An extracted backup archive contains exactly one top-level folder.
fn single_top_level_dir(extract_dir: &Path) -> Result<PathBuf, RestoreError> {
    let dirs: Vec<PathBuf> = fs::read_dir(extract_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(RestoreError::InvalidBackup(
            "archive contains no backup folder".to_string(),
        )),
        _ => Err(RestoreError::InvalidBackup(
            "archive contains more than one top-level folder".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backup::{BackupKind, BackupMetadata, RegionCapture, RegionMap};
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Erase,
        Write(u32),
    }

    /// Gateway double that records the op sequence and can fail one write.
    struct ScriptedGateway {
        fail_write_at: Option<u32>,
        ops: RefCell<Vec<Op>>,
    }

    impl ScriptedGateway {
        fn ok() -> Self {
            Self { fail_write_at: None, ops: RefCell::new(Vec::new()) }
        }
    }

    impl ToolGateway for ScriptedGateway {
        fn read_region(&self, _: u32, _: u32, _: &Path) -> Result<(), ToolError> {
            unreachable!("restore never reads flash")
        }

        fn read_all(&self, _: u32, _: &Path) -> Result<(), ToolError> {
            unreachable!("restore never reads flash")
        }

        fn erase_flash(&self) -> Result<(), ToolError> {
            self.ops.borrow_mut().push(Op::Erase);
            Ok(())
        }

        fn write_region(&self, offset: u32, _image: &Path) -> Result<(), ToolError> {
            if self.fail_write_at == Some(offset) {
                return Err(ToolError::Failure {
                    tool: "esptool".into(),
                    message: format!("write at 0x{offset:X} failed"),
                });
            }
            self.ops.borrow_mut().push(Op::Write(offset));
            Ok(())
        }

        fn build_firmware(&self, _: &Path) -> Result<(), ToolError> {
            unreachable!()
        }

        fn git_commit_all(&self, _: &Path, _: &str) -> Result<(), ToolError> {
            unreachable!()
        }

        fn git_push(&self, _: &Path) -> Result<(), ToolError> {
            unreachable!()
        }
    }

    /// Two-region backup folder: A at 0x0, B at 0x100.
    fn two_region_backup(dir: &Path) -> PathBuf {
        let folder = dir.join("bronco_v2.0.0_20260801_120000_FULL");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("a.bin"), [1u8; 16]).unwrap();
        fs::write(folder.join("b.bin"), [2u8; 16]).unwrap();

        let mut regions = RegionMap::new();
        regions.insert(
            "a",
            RegionCapture { offset: "0x0".into(), size: 0x100, file: "a.bin".into(), actual_size: 16 },
        );
        regions.insert(
            "b",
            RegionCapture { offset: "0x100".into(), size: 0x100, file: "b.bin".into(), actual_size: 16 },
        );
        let metadata = BackupMetadata {
            version: "2.0.0".into(),
            timestamp: "20260801_120000".into(),
            kind: BackupKind::FullHardware,
            device: "ESP32-S3-Touch-LCD-7".into(),
            chip: "esp32s3".into(),
            flash_size: "16MB".into(),
            backup_date: "2026-08-01T12:00:00Z".into(),
            description: "test".into(),
            regions,
            full_dump: None,
        };
        fs::write(
            folder.join(BACKUP_METADATA_FILE),
            serde_json::to_string_pretty(&metadata).unwrap(),
        )
        .unwrap();
        folder
    }

    #[test]
    fn restore_erases_once_then_writes_in_recorded_order() {
        let dir = tempdir().unwrap();
        let folder = two_region_backup(dir.path());
        let gateway = ScriptedGateway::ok();

        RestoreEngine::new(&gateway).restore_local(&folder).unwrap();
        assert_eq!(*gateway.ops.borrow(), vec![Op::Erase, Op::Write(0x0), Op::Write(0x100)]);
    }

    #[test]
    fn first_write_failure_stops_the_sequence() {
        let dir = tempdir().unwrap();
        let folder = two_region_backup(dir.path());
        let gateway = ScriptedGateway { fail_write_at: Some(0x0), ..ScriptedGateway::ok() };

        let err = RestoreEngine::new(&gateway).restore_local(&folder).unwrap_err();
        match err {
            RestoreError::PartialRestore { region, completed, total, .. } => {
                assert_eq!(region, "a");
                assert_eq!(completed, 0);
                assert_eq!(total, 2);
            }
            other => panic!("expected PartialRestore, got {other}"),
        }
        // The second write was never attempted.
        assert_eq!(*gateway.ops.borrow(), vec![Op::Erase]);
    }

    #[test]
    fn missing_metadata_is_invalid_backup() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("bronco_v1.0.0_x");
        fs::create_dir_all(&folder).unwrap();

        let gateway = ScriptedGateway::ok();
        let err = RestoreEngine::new(&gateway).restore_local(&folder).unwrap_err();
        assert!(matches!(err, RestoreError::InvalidBackup(_)));
        assert!(gateway.ops.borrow().is_empty(), "device must not be touched");
    }

    #[test]
    fn missing_region_file_aborts_before_writing() {
        let dir = tempdir().unwrap();
        let folder = two_region_backup(dir.path());
        fs::remove_file(folder.join("b.bin")).unwrap();

        let gateway = ScriptedGateway::ok();
        let err = RestoreEngine::new(&gateway).restore_local(&folder).unwrap_err();
        assert!(matches!(err, RestoreError::InvalidBackup(_)));
    }

    #[test]
    fn extracted_archive_must_have_single_top_folder() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("one")).unwrap();
        fs::create_dir_all(dir.path().join("two")).unwrap();
        assert!(single_top_level_dir(dir.path()).is_err());

        fs::remove_dir(dir.path().join("two")).unwrap();
        assert_eq!(single_top_level_dir(dir.path()).unwrap(), dir.path().join("one"));
    }
}
