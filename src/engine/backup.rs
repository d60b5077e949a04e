//! Backup Engine
//!
//! Orchestrates the two backup protocols over the external tool gateway:
//! a full hardware capture of every flash region, and a lightweight release
//! that builds and stages a firmware image without touching device flash.
//! Metadata documents are written whole, via a temp-file rename, only after
//! every required step has succeeded.

use chrono::Utc;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::flash::{self, FLASH_REGIONS, FLASH_SIZE};
use super::tools::{ToolError, ToolGateway};
use super::version::{IncrementKind, VersionError, VersionStore, VersionTriple};

/// Directory under the project root holding all backup folders.
pub const BACKUPS_DIR: &str = "backups";

/// Backup folder name prefix (`bronco_v<version>_<timestamp>[_FULL]`).
pub const FOLDER_PREFIX: &str = "bronco_v";

/// Metadata document of a full hardware backup.
pub const BACKUP_METADATA_FILE: &str = "backup_metadata.json";

/// Metadata document of a lightweight release.
pub const VERSION_METADATA_FILE: &str = "version_metadata.json";

/// Standalone restore script generated alongside a full backup.
pub const RESTORE_SCRIPT_FILE: &str = "RESTORE.sh";

/// Staged firmware image name inside a release folder.
pub const FIRMWARE_FILE: &str = "firmware.bin";

/// Relative path of the freshly built image inside the project tree.
const BUILT_FIRMWARE: &str = ".pio/build/waveshare_7in/firmware.bin";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("capture of region {region} failed: {source}")]
    RegionCapture { region: String, source: ToolError },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Which protocol produced a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    #[serde(rename = "full_backup")]
    FullHardware,
    #[serde(rename = "version_update")]
    LightweightRelease,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullHardware => write!(f, "Full Backup"),
            Self::LightweightRelease => write!(f, "Version Update"),
        }
    }
}

/// One captured region inside the metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCapture {
    /// Hex offset string, e.g. `0x10000`.
    pub offset: String,
    pub size: u32,
    pub file: String,
    pub actual_size: u64,
}

impl RegionCapture {
    /// Numeric flash offset parsed back out of the hex string.
    pub fn offset_value(&self) -> Option<u32> {
        let hex = self.offset.strip_prefix("0x").or_else(|| self.offset.strip_prefix("0X"))?;
        u32::from_str_radix(hex, 16).ok()
    }
}

/// Region→capture map that keeps insertion order.
///
/// The JSON document stores regions as an object, and restore replays them in
/// the recorded (physical-layout) order, so an ordinary sorted or hashed map
/// would lose the property that matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionMap(Vec<(String, RegionCapture)>);

impl RegionMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, capture: RegionCapture) {
        self.0.push((name.into(), capture));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegionCapture)> {
        self.0.iter().map(|(name, capture)| (name.as_str(), capture))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for RegionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, capture) in &self.0 {
            map.serialize_entry(name, capture)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RegionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RegionMapVisitor;

        impl<'de> Visitor<'de> for RegionMapVisitor {
            type Value = RegionMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of region name to capture info")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, capture)) = access.next_entry::<String, RegionCapture>()? {
                    entries.push((name, capture));
                }
                Ok(RegionMap(entries))
            }
        }

        deserializer.deserialize_map(RegionMapVisitor)
    }
}

/// Metadata document of a full hardware backup (`backup_metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub device: String,
    pub chip: String,
    pub flash_size: String,
    pub backup_date: String,
    pub description: String,
    pub regions: RegionMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_dump: Option<String>,
}

/// Metadata document of a lightweight release (`version_metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub version: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub device: String,
    pub chip: String,
    pub created_date: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_size: Option<u64>,
}

/// Durable handle to one completed backup.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub version: VersionTriple,
    pub kind: BackupKind,
    pub folder: PathBuf,
}

/// Options for the lightweight release protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseOptions {
    /// Flash the freshly built image to a connected device, best-effort.
    pub flash_device: bool,
}

pub struct BackupEngine<'a, G: ToolGateway> {
    project_dir: PathBuf,
    backups_dir: PathBuf,
    gateway: &'a G,
    port: String,
    baud: u32,
}

impl<'a, G: ToolGateway> BackupEngine<'a, G> {
    pub fn new(project_dir: &Path, gateway: &'a G, port: impl Into<String>, baud: u32) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            backups_dir: project_dir.join(BACKUPS_DIR),
            gateway,
            port: port.into(),
            baud,
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Capture every flash region from the device into a new backup folder.
    ///
    /// Bumps the major version first. Any region read failure aborts the
    /// whole operation before metadata is written; only stray region files
    /// can remain. The whole-flash dump is best-effort and never fatal.
    pub fn full_backup(&self, versions: &mut VersionStore) -> Result<BackupRecord, BackupError> {
        let version = versions.increment(IncrementKind::Major)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let folder = self
            .backups_dir
            .join(format!("{FOLDER_PREFIX}{version}_{timestamp}_FULL"));
        fs::create_dir_all(&folder)?;

        tracing::info!(%version, folder = %folder.display(), "starting full hardware backup");

        let mut regions = RegionMap::new();
        let total = FLASH_REGIONS.len();
        for (idx, region) in FLASH_REGIONS.iter().enumerate() {
            let file = format!("{}.bin", region.name);
            let dest = folder.join(&file);
            tracing::info!(
                step = idx + 1,
                total,
                region = region.name,
                offset = %format_args!("0x{:X}", region.offset),
                size = region.size,
                "reading region"
            );
            self.gateway
                .read_region(region.offset, region.size, &dest)
                .map_err(|source| BackupError::RegionCapture {
                    region: region.name.to_string(),
                    source,
                })?;
            let actual_size = fs::metadata(&dest)?.len();
            regions.insert(
                region.name,
                RegionCapture {
                    offset: format!("0x{:X}", region.offset),
                    size: region.size,
                    file,
                    actual_size,
                },
            );
        }

        let dump_path = folder.join(flash::FULL_DUMP_FILE);
        let full_dump = match self.gateway.read_all(FLASH_SIZE, &dump_path) {
            Ok(()) => Some(flash::FULL_DUMP_FILE.to_string()),
            Err(e) => {
                // Per-region images already provide full recoverability.
                tracing::warn!(error = %e, "whole-flash dump failed (not critical)");
                let _ = fs::remove_file(&dump_path);
                None
            }
        };

        let metadata = BackupMetadata {
            version: version.to_string(),
            timestamp,
            kind: BackupKind::FullHardware,
            device: flash::DEVICE.to_string(),
            chip: flash::CHIP.to_string(),
            flash_size: "16MB".to_string(),
            backup_date: Utc::now().to_rfc3339(),
            description: "Complete hardware + software backup from device".to_string(),
            regions,
            full_dump,
        };
        write_json_atomic(&folder.join(BACKUP_METADATA_FILE), &metadata)?;
        self.write_restore_script(&folder, &metadata)?;

        tracing::info!(%version, "full backup complete");
        Ok(BackupRecord { version, kind: BackupKind::FullHardware, folder })
    }

    /// Build and stage a release without reading device flash.
    ///
    /// Bumps the given (minor or build) version, runs the external build,
    /// stages the image for publishing, optionally flashes it to a connected
    /// device, then commits and pushes the source tree. The device flash and
    /// git steps are best-effort; a build failure aborts.
    pub fn release_backup(
        &self,
        versions: &mut VersionStore,
        kind: IncrementKind,
        options: ReleaseOptions,
    ) -> Result<BackupRecord, BackupError> {
        let version = versions.increment(kind)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let folder = self
            .backups_dir
            .join(format!("{FOLDER_PREFIX}{version}_{timestamp}"));
        fs::create_dir_all(&folder)?;

        tracing::info!(%version, "building firmware");
        self.gateway.build_firmware(&self.project_dir)?;

        let built = self.project_dir.join(BUILT_FIRMWARE);
        let staged = folder.join(FIRMWARE_FILE);
        let (firmware, firmware_size) = if built.exists() {
            fs::copy(&built, &staged)?;
            let size = fs::metadata(&staged)?.len();
            tracing::info!(bytes = size, "firmware staged");
            (Some(FIRMWARE_FILE.to_string()), Some(size))
        } else {
            tracing::warn!(path = %built.display(), "built firmware not found, nothing staged");
            (None, None)
        };

        if options.flash_device && staged.exists() {
            match self.gateway.write_region(flash::APP_OFFSET, &staged) {
                Ok(()) => tracing::info!("flashed new image to connected device"),
                Err(e) => tracing::warn!(error = %e, "device flash failed, continuing"),
            }
        }

        let metadata = ReleaseMetadata {
            version: version.to_string(),
            timestamp,
            kind: BackupKind::LightweightRelease,
            device: flash::DEVICE.to_string(),
            chip: flash::CHIP.to_string(),
            created_date: Utc::now().to_rfc3339(),
            description: "Project state snapshot - incremental version update".to_string(),
            firmware,
            firmware_size,
        };
        write_json_atomic(&folder.join(VERSION_METADATA_FILE), &metadata)?;

        let message = format!("Version {version} - incremental update");
        match self.gateway.git_commit_all(&self.project_dir, &message) {
            Ok(()) => {
                if let Err(e) = self.gateway.git_push(&self.project_dir) {
                    tracing::warn!(error = %e, "git push failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "git commit skipped (possibly no changes)"),
        }

        tracing::info!(%version, "release snapshot complete");
        Ok(BackupRecord { version, kind: BackupKind::LightweightRelease, folder })
    }

    /// Write a standalone erase-then-write script into the backup folder,
    /// listing the captured regions in their recorded order.
    fn write_restore_script(&self, folder: &Path, metadata: &BackupMetadata) -> Result<(), BackupError> {
        let mut script = format!(
            "#!/bin/sh\n\
             # Bronco Controls - device restore\n\
             # Version: {version}\n\
             # Created: {date}\n\
             #\n\
             # Completely erases the device flash, then rewrites every captured\n\
             # region at its original offset. Runnable standalone with only esptool.\n\
             \n\
             set -e\n\
             \n\
             PORT=\"${{1:-{port}}}\"\n\
             BAUD={baud}\n\
             \n\
             echo \"Erasing flash...\"\n\
             python -m esptool --chip {chip} --port \"$PORT\" erase_flash\n\
             \n\
             echo \"Restoring regions...\"\n",
            version = metadata.version,
            date = metadata.backup_date,
            port = self.port,
            baud = self.baud,
            chip = flash::CHIP,
        );
        for (_, capture) in metadata.regions.iter() {
            script.push_str(&format!(
                "python -m esptool --chip {} --port \"$PORT\" --baud \"$BAUD\" write_flash {} {}\n",
                flash::CHIP,
                capture.offset,
                capture.file
            ));
        }
        script.push_str("\necho \"Restore complete. Device will reboot automatically.\"\n");

        let path = folder.join(RESTORE_SCRIPT_FILE);
        fs::write(&path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }
}

/// Whole-document write: serialize to a temp file, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BackupError> {
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// Gateway double that fabricates region files and can be told to fail
    /// at a specific offset.
    struct ScriptedGateway {
        fail_read_at: Option<u32>,
        fail_dump: bool,
        writes: RefCell<Vec<u32>>,
        git_ops: RefCell<Vec<String>>,
    }

    impl ScriptedGateway {
        fn ok() -> Self {
            Self {
                fail_read_at: None,
                fail_dump: false,
                writes: RefCell::new(Vec::new()),
                git_ops: RefCell::new(Vec::new()),
            }
        }

        fn failing_at(offset: u32) -> Self {
            Self { fail_read_at: Some(offset), ..Self::ok() }
        }
    }

    impl ToolGateway for ScriptedGateway {
        fn read_region(&self, offset: u32, size: u32, dest: &Path) -> Result<(), ToolError> {
            if self.fail_read_at == Some(offset) {
                return Err(ToolError::Failure {
                    tool: "esptool".into(),
                    message: format!("read at 0x{offset:X} failed"),
                });
            }
            std::fs::write(dest, vec![0xAA; (size as usize).min(16)]).unwrap();
            Ok(())
        }

        fn read_all(&self, _size: u32, dest: &Path) -> Result<(), ToolError> {
            if self.fail_dump {
                return Err(ToolError::TimedOut { tool: "esptool".into(), seconds: 600 });
            }
            std::fs::write(dest, [0u8; 32]).unwrap();
            Ok(())
        }

        fn erase_flash(&self) -> Result<(), ToolError> {
            Ok(())
        }

        fn write_region(&self, offset: u32, _image: &Path) -> Result<(), ToolError> {
            self.writes.borrow_mut().push(offset);
            Ok(())
        }

        fn build_firmware(&self, project_dir: &Path) -> Result<(), ToolError> {
            let out = project_dir.join(BUILT_FIRMWARE);
            std::fs::create_dir_all(out.parent().unwrap()).unwrap();
            std::fs::write(out, [0x42; 64]).unwrap();
            Ok(())
        }

        fn git_commit_all(&self, _project_dir: &Path, message: &str) -> Result<(), ToolError> {
            self.git_ops.borrow_mut().push(format!("commit: {message}"));
            Ok(())
        }

        fn git_push(&self, _project_dir: &Path) -> Result<(), ToolError> {
            self.git_ops.borrow_mut().push("push".into());
            Ok(())
        }
    }

    fn find_backup_folder(backups_dir: &Path) -> Option<PathBuf> {
        fs::read_dir(backups_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .find(|p| p.is_dir())
    }

    #[test]
    fn full_backup_records_every_region_in_offset_order() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::ok();
        let engine = BackupEngine::new(dir.path(), &gateway, "COM5", 460800);
        let mut versions = VersionStore::load(dir.path());

        let record = engine.full_backup(&mut versions).unwrap();
        assert_eq!(record.version, VersionTriple::new(2, 0, 0));
        assert_eq!(record.kind, BackupKind::FullHardware);

        let content = fs::read_to_string(record.folder.join(BACKUP_METADATA_FILE)).unwrap();
        let metadata: BackupMetadata = serde_json::from_str(&content).unwrap();
        assert_eq!(metadata.regions.len(), FLASH_REGIONS.len());
        assert_eq!(metadata.full_dump.as_deref(), Some(flash::FULL_DUMP_FILE));

        let offsets: Vec<u32> = metadata
            .regions
            .iter()
            .map(|(_, c)| c.offset_value().unwrap())
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted, "regions must serialize in offset order");
    }

    #[test]
    fn restore_script_lists_one_write_per_region() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::ok();
        let engine = BackupEngine::new(dir.path(), &gateway, "COM7", 460800);
        let mut versions = VersionStore::load(dir.path());

        let record = engine.full_backup(&mut versions).unwrap();
        let script = fs::read_to_string(record.folder.join(RESTORE_SCRIPT_FILE)).unwrap();

        assert_eq!(script.matches("erase_flash").count(), 1);
        assert_eq!(script.matches("write_flash").count(), FLASH_REGIONS.len());

        // Writes appear in physical-layout order.
        let mut last = None;
        for line in script.lines().filter(|l| l.contains("write_flash")) {
            let offset = line
                .split_whitespace()
                .find(|w| w.starts_with("0x"))
                .and_then(|w| u32::from_str_radix(&w[2..], 16).ok())
                .unwrap();
            if let Some(prev) = last {
                assert!(offset > prev);
            }
            last = Some(offset);
        }
    }

    #[test]
    fn any_region_failure_leaves_no_metadata() {
        let dir = tempdir().unwrap();
        // Fail on the third region.
        let gateway = ScriptedGateway::failing_at(FLASH_REGIONS[2].offset);
        let engine = BackupEngine::new(dir.path(), &gateway, "COM5", 460800);
        let mut versions = VersionStore::load(dir.path());

        let err = engine.full_backup(&mut versions).unwrap_err();
        assert!(matches!(err, BackupError::RegionCapture { ref region, .. } if region == "nvs"));

        let folder = find_backup_folder(&dir.path().join(BACKUPS_DIR)).unwrap();
        assert!(!folder.join(BACKUP_METADATA_FILE).exists());
        assert!(!folder.join(RESTORE_SCRIPT_FILE).exists());
    }

    #[test]
    fn dump_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway { fail_dump: true, ..ScriptedGateway::ok() };
        let engine = BackupEngine::new(dir.path(), &gateway, "COM5", 460800);
        let mut versions = VersionStore::load(dir.path());

        let record = engine.full_backup(&mut versions).unwrap();
        let content = fs::read_to_string(record.folder.join(BACKUP_METADATA_FILE)).unwrap();
        let metadata: BackupMetadata = serde_json::from_str(&content).unwrap();
        assert!(metadata.full_dump.is_none());
        assert!(!record.folder.join(flash::FULL_DUMP_FILE).exists());
    }

    #[test]
    fn release_backup_stages_firmware_and_pushes() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::ok();
        let engine = BackupEngine::new(dir.path(), &gateway, "COM5", 460800);
        let mut versions = VersionStore::load(dir.path());

        let record = engine
            .release_backup(&mut versions, IncrementKind::Build, ReleaseOptions::default())
            .unwrap();
        assert_eq!(record.version, VersionTriple::new(1, 3, 79));
        assert!(record.folder.join(FIRMWARE_FILE).exists());

        let content = fs::read_to_string(record.folder.join(VERSION_METADATA_FILE)).unwrap();
        let metadata: ReleaseMetadata = serde_json::from_str(&content).unwrap();
        assert_eq!(metadata.firmware.as_deref(), Some(FIRMWARE_FILE));
        assert_eq!(metadata.firmware_size, Some(64));

        let git_ops = gateway.git_ops.borrow();
        assert_eq!(git_ops.len(), 2);
        assert!(git_ops[0].starts_with("commit: Version 1.3.79"));
        assert_eq!(git_ops[1], "push");

        // No device flash unless requested.
        assert!(gateway.writes.borrow().is_empty());
    }

    #[test]
    fn release_backup_flashes_device_when_asked() {
        let dir = tempdir().unwrap();
        let gateway = ScriptedGateway::ok();
        let engine = BackupEngine::new(dir.path(), &gateway, "COM5", 460800);
        let mut versions = VersionStore::load(dir.path());

        engine
            .release_backup(&mut versions, IncrementKind::Minor, ReleaseOptions { flash_device: true })
            .unwrap();
        assert_eq!(*gateway.writes.borrow(), vec![flash::APP_OFFSET]);
    }

    #[test]
    fn region_map_round_trips_in_order() {
        let mut map = RegionMap::new();
        for region in FLASH_REGIONS.iter().rev() {
            map.insert(
                region.name,
                RegionCapture {
                    offset: format!("0x{:X}", region.offset),
                    size: region.size,
                    file: format!("{}.bin", region.name),
                    actual_size: u64::from(region.size),
                },
            );
        }

        let json = serde_json::to_string(&map).unwrap();
        let back: RegionMap = serde_json::from_str(&json).unwrap();
        let names: Vec<&str> = back.iter().map(|(n, _)| n).collect();
        let expected: Vec<&str> = FLASH_REGIONS.iter().rev().map(|r| r.name).collect();
        assert_eq!(names, expected);
    }
}
