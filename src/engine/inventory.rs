//! Backup Inventory
//!
//! Merges locally stored backup folders with the remotely published archives
//! into one version-sorted catalog. Local scanning skips anything malformed;
//! the merge itself is a pure projection over two already-fetched
//! collections.

use regex_lite::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::backup::{BackupKind, BACKUP_METADATA_FILE, FOLDER_PREFIX, VERSION_METADATA_FILE};
use super::publisher::RemoteFile;
use super::version::VersionTriple;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("failed to scan backups directory: {0}")]
    Scan(#[from] std::io::Error),
}

/// Where an inventory entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Remote,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Normalized view of one backup, local folder or published archive.
#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub version: VersionTriple,
    pub date: Option<String>,
    pub size: u64,
    /// Folder path for local entries, download URL for remote ones.
    pub locator: String,
    pub source: Source,
    pub kind: BackupKind,
}

/// The subset of metadata the inventory needs from either document shape.
#[derive(Deserialize)]
struct MetadataProbe {
    version: String,
    #[serde(rename = "type")]
    kind: BackupKind,
    #[serde(default)]
    backup_date: Option<String>,
    #[serde(default)]
    created_date: Option<String>,
}

/// Scan the backups directory for well-formed backup folders.
///
/// Folders without a parsable metadata document are skipped, never fatal.
/// A missing backups directory is an empty inventory.
pub fn list_local(backups_dir: &Path) -> Result<Vec<InventoryEntry>, InventoryError> {
    let mut entries = Vec::new();
    if !backups_dir.exists() {
        return Ok(entries);
    }

    for dir_entry in fs::read_dir(backups_dir)? {
        let path = dir_entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !path.is_dir() || !name.starts_with(FOLDER_PREFIX) {
            continue;
        }
        match probe_folder(&path) {
            Some(entry) => entries.push(entry),
            None => tracing::debug!(folder = %path.display(), "skipping folder without usable metadata"),
        }
    }
    Ok(entries)
}

fn probe_folder(folder: &Path) -> Option<InventoryEntry> {
    let content = fs::read_to_string(folder.join(BACKUP_METADATA_FILE))
        .or_else(|_| fs::read_to_string(folder.join(VERSION_METADATA_FILE)))
        .ok()?;
    let probe: MetadataProbe = serde_json::from_str(&content).ok()?;
    let version = VersionTriple::parse(&probe.version)?;

    Some(InventoryEntry {
        version,
        date: probe.backup_date.or(probe.created_date),
        size: folder_size(folder),
        locator: folder.display().to_string(),
        source: Source::Local,
        kind: probe.kind,
    })
}

fn folder_size(folder: &Path) -> u64 {
    fn walk(dir: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(dir) else { return 0 };
        entries
            .filter_map(Result::ok)
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    walk(&path)
                } else {
                    fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
                }
            })
            .sum()
    }
    walk(folder)
}

/// Normalize a remote listing, keeping only full-backup archives
/// (`bronco_vX.Y.Z_FULL.zip`).
pub fn remote_entries(files: &[RemoteFile]) -> Vec<InventoryEntry> {
    let pattern = Regex::new(r"^bronco_v(\d+)\.(\d+)\.(\d+)_FULL\.zip$").expect("valid pattern");
    files
        .iter()
        .filter_map(|file| {
            let caps = pattern.captures(&file.name)?;
            let version = VersionTriple::new(
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
                caps[3].parse().ok()?,
            );
            Some(InventoryEntry {
                version,
                date: None,
                size: file.size,
                locator: file.download_url.clone()?,
                source: Source::Remote,
                kind: BackupKind::FullHardware,
            })
        })
        .collect()
}

/// Merge local and remote entries into one catalog, newest version first.
pub fn merge_entries(
    local: Vec<InventoryEntry>,
    remote: Vec<InventoryEntry>,
) -> Vec<InventoryEntry> {
    let mut merged = local;
    merged.extend(remote);
    merged.sort_by(|a, b| b.version.cmp(&a.version));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn local_entry(version: VersionTriple) -> InventoryEntry {
        InventoryEntry {
            version,
            date: None,
            size: 0,
            locator: format!("backups/bronco_v{version}"),
            source: Source::Local,
            kind: BackupKind::FullHardware,
        }
    }

    fn write_backup_folder(dir: &Path, version: &str, metadata_file: &str, kind: &str) {
        let folder = dir.join(format!("bronco_v{version}_20260801_120000"));
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("firmware.bin"), [0u8; 100]).unwrap();
        fs::write(
            folder.join(metadata_file),
            format!(
                r#"{{"version": "{version}", "type": "{kind}", "backup_date": "2026-08-01T12:00:00Z"}}"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn merged_catalog_is_version_descending() {
        let local = vec![
            local_entry(VersionTriple::new(1, 2, 3)),
            local_entry(VersionTriple::new(2, 0, 0)),
        ];
        let remote = vec![InventoryEntry {
            version: VersionTriple::new(1, 5, 0),
            date: None,
            size: 10,
            locator: "https://example/bronco_v1.5.0_FULL.zip".into(),
            source: Source::Remote,
            kind: BackupKind::FullHardware,
        }];

        let merged = merge_entries(local, remote);
        let versions: Vec<String> = merged.iter().map(|e| e.version.to_string()).collect();
        assert_eq!(versions, vec!["2.0.0", "1.5.0", "1.2.3"]);
    }

    #[test]
    fn local_scan_reads_both_document_shapes() {
        let dir = tempdir().unwrap();
        write_backup_folder(dir.path(), "2.0.0", BACKUP_METADATA_FILE, "full_backup");
        write_backup_folder(dir.path(), "1.3.80", VERSION_METADATA_FILE, "version_update");

        let mut entries = list_local(dir.path()).unwrap();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, BackupKind::FullHardware);
        assert_eq!(entries[1].kind, BackupKind::LightweightRelease);
        assert!(entries.iter().all(|e| e.size > 0));
    }

    #[test]
    fn malformed_folders_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        write_backup_folder(dir.path(), "2.0.0", BACKUP_METADATA_FILE, "full_backup");

        // No metadata at all.
        fs::create_dir_all(dir.path().join("bronco_v9.9.9_bare")).unwrap();
        // Corrupt metadata.
        let bad = dir.path().join("bronco_v8.8.8_bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(BACKUP_METADATA_FILE), "{broken").unwrap();
        // Unrelated folder.
        fs::create_dir_all(dir.path().join("notes")).unwrap();

        let entries = list_local(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, VersionTriple::new(2, 0, 0));
    }

    #[test]
    fn missing_backups_dir_is_empty_inventory() {
        let dir = tempdir().unwrap();
        let entries = list_local(&dir.path().join("backups")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn remote_listing_keeps_only_strict_full_archives() {
        let files = vec![
            RemoteFile {
                name: "bronco_v1.5.0_FULL.zip".into(),
                size: 1024,
                download_url: Some("https://example/bronco_v1.5.0_FULL.zip".into()),
            },
            RemoteFile {
                name: "bronco_v1.6.0.zip".into(),
                size: 512,
                download_url: Some("https://example/bronco_v1.6.0.zip".into()),
            },
            RemoteFile {
                name: "bronco_v1.7.0.bin".into(),
                size: 256,
                download_url: Some("https://example/bronco_v1.7.0.bin".into()),
            },
            RemoteFile { name: "README.md".into(), size: 10, download_url: None },
        ];

        let entries = remote_entries(&files);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, VersionTriple::new(1, 5, 0));
        assert_eq!(entries[0].source, Source::Remote);
    }
}
