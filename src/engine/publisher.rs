//! Artifact Publisher
//!
//! Uploads firmware binaries and backup archives to the GitHub repository and
//! creates tagged releases for full backups. Credentials resolve through an
//! override variable, the generic token variables, then a best-effort OS
//! keyring query; a missing credential degrades authenticated operations to
//! [`PublishError::MissingCredential`] instead of crashing, and any
//! authenticated call that bounces with an auth error is retried once
//! unauthenticated so public read access still works.

use base64::Engine as _;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::backup::{BackupKind, FIRMWARE_FILE};
use super::version::VersionTriple;

const GITHUB_API_URL: &str = "https://api.github.com";
const GITHUB_UPLOADS_URL: &str = "https://uploads.github.com";

/// Repository and branch the artifacts are published to.
pub const GITHUB_REPO: &str = "js9467/cancontroller";
pub const GITHUB_BRANCH: &str = "master";
const VERSIONS_FOLDER: &str = "versions";

/// Explicit credential override, checked first.
pub const ENV_TOKEN_OVERRIDE: &str = "BRONCO_GITHUB_TOKEN";
/// Generic token variable.
pub const ENV_TOKEN: &str = "GITHUB_TOKEN";
/// Alternate token variable name.
pub const ENV_TOKEN_ALT: &str = "GH_TOKEN";

const KEYRING_SERVICE: &str = "bronco";
const KEYRING_KEY: &str = "github_token";

/// Auxiliary updater script attached to full-backup releases, if present.
const UPDATER_SCRIPT: &str = "tools/usb_updater.py";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const LISTING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no usable GitHub credential (set {ENV_TOKEN_OVERRIDE} or {ENV_TOKEN})")]
    MissingCredential,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload of {name} failed: HTTP {status}: {body}")]
    Upload { name: String, status: u16, body: String },
    #[error("release creation failed: HTTP {status}: {body}")]
    Release { status: u16, body: String },
    #[error("listing failed: HTTP {status}")]
    Listing { status: u16 },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a release-creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Created,
    /// The tag already exists on the remote; treated as already published.
    AlreadyPublished,
}

/// One file in the remote `versions/` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Serialize)]
struct ContentsRequest<'a> {
    message: String,
    content: String,
    branch: &'a str,
}

#[derive(Serialize)]
struct CreateReleaseRequest {
    tag_name: String,
    name: String,
    body: String,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    id: u64,
}

/// Resolve the publishing credential: override variable, generic variables,
/// then a best-effort OS keyring query. First non-empty value wins.
pub fn resolve_token() -> Option<String> {
    resolve_token_from(|name| std::env::var(name).ok(), keyring_token)
}

/// Pure resolution core, parameterized over the environment and the
/// credential store so the precedence is unit-testable.
pub fn resolve_token_from(
    env: impl Fn(&str) -> Option<String>,
    store: impl FnOnce() -> Option<String>,
) -> Option<String> {
    for name in [ENV_TOKEN_OVERRIDE, ENV_TOKEN, ENV_TOKEN_ALT] {
        if let Some(value) = env(name) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    store().filter(|value| !value.trim().is_empty())
}

/// Best-effort OS credential store lookup; never fatal.
fn keyring_token() -> Option<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_KEY).ok()?;
    match entry.get_password() {
        Ok(token) => Some(token),
        Err(e) => {
            tracing::debug!(error = %e, "no token in OS credential store");
            None
        }
    }
}

pub struct Publisher {
    client: Client,
    token: Option<String>,
    repo: String,
    api_base: String,
    uploads_base: String,
}

impl Publisher {
    pub fn new(token: Option<String>) -> Self {
        Self::with_endpoints(token, GITHUB_API_URL, GITHUB_UPLOADS_URL)
    }

    /// Create a publisher against explicit endpoints (for testing).
    pub fn with_endpoints(token: Option<String>, api_base: &str, uploads_base: &str) -> Self {
        let client = Client::builder()
            .user_agent("bronco-backup")
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            token,
            repo: GITHUB_REPO.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            uploads_base: uploads_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Upload the staged OTA binary as `bronco_v<version>.bin`.
    ///
    /// Attempted for every release kind; a full-hardware folder carries
    /// region images rather than a staged binary, in which case there is
    /// nothing to upload and the step is skipped with a warning.
    pub fn upload_binary(&self, folder: &Path, version: VersionTriple) -> Result<(), PublishError> {
        let firmware = folder.join(FIRMWARE_FILE);
        if !firmware.exists() {
            tracing::warn!(folder = %folder.display(), "no staged firmware, skipping binary upload");
            return Ok(());
        }
        let name = format!("bronco_v{version}.bin");
        tracing::info!(%name, "uploading OTA binary");
        let bytes = fs::read(&firmware)?;
        self.put_contents(&name, &format!("Add OTA firmware v{version}"), &bytes)
    }

    /// Package the whole backup folder into a zip and upload it.
    ///
    /// The local archive is deleted after the attempt, success or not.
    pub fn upload_archive(
        &self,
        folder: &Path,
        version: VersionTriple,
        kind: BackupKind,
    ) -> Result<(), PublishError> {
        let suffix = match kind {
            BackupKind::FullHardware => "_FULL",
            BackupKind::LightweightRelease => "",
        };
        let name = format!("bronco_v{version}{suffix}.zip");
        let zip_path = folder.parent().unwrap_or(folder).join(&name);

        tracing::info!(%name, "packaging backup archive");
        let result = package_archive(folder, &zip_path).and_then(|()| {
            let bytes = fs::read(&zip_path)?;
            self.put_contents(&name, &format!("Add backup archive v{version}"), &bytes)
        });

        if zip_path.exists() {
            if let Err(e) = fs::remove_file(&zip_path) {
                tracing::warn!(error = %e, "failed to remove temporary archive");
            } else {
                tracing::debug!(%name, "temporary archive removed");
            }
        }
        result
    }

    /// Create the tagged release for a full backup and attach its assets.
    ///
    /// A tag that already exists is reported as [`ReleaseOutcome::AlreadyPublished`].
    /// Asset attachment is best-effort: a failed asset is logged and does not
    /// undo the release.
    pub fn create_release(
        &self,
        project_dir: &Path,
        folder: &Path,
        version: VersionTriple,
    ) -> Result<ReleaseOutcome, PublishError> {
        if self.token.is_none() {
            return Err(PublishError::MissingCredential);
        }

        let tag = format!("v{version}");
        tracing::info!(%tag, "creating release");
        let request = CreateReleaseRequest {
            tag_name: tag.clone(),
            name: format!("Bronco Controls v{version}"),
            body: format!("Full device backup v{version}"),
        };
        let url = format!("{}/repos/{}/releases", self.api_base, self.repo);
        let response = self.send(|| self.client.post(&url).json(&request))?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            tracing::info!(%tag, "tag already exists, release already published");
            return Ok(ReleaseOutcome::AlreadyPublished);
        }
        if !status.is_success() {
            return Err(PublishError::Release {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let release: ReleaseResponse = response.json()?;

        // Backup archive asset, packaged fresh and deleted after the attempt.
        let asset_name = format!("bronco_v{version}_FULL_BACKUP.zip");
        let zip_path = folder.parent().unwrap_or(folder).join(&asset_name);
        let uploaded = package_archive(folder, &zip_path).and_then(|()| {
            let bytes = fs::read(&zip_path)?;
            self.upload_asset(release.id, &asset_name, "application/zip", &bytes)
        });
        if zip_path.exists() {
            let _ = fs::remove_file(&zip_path);
        }
        if let Err(e) = uploaded {
            tracing::warn!(error = %e, "backup archive asset upload failed");
        }

        // Auxiliary updater script, attached when the project carries one.
        let updater = project_dir.join(UPDATER_SCRIPT);
        if updater.exists() {
            let attach = fs::read(&updater).map_err(PublishError::from).and_then(|bytes| {
                self.upload_asset(release.id, "usb_updater.py", "text/x-python", &bytes)
            });
            if let Err(e) = attach {
                tracing::warn!(error = %e, "updater script asset upload failed");
            }
        } else {
            tracing::debug!(path = %updater.display(), "no updater script to attach");
        }

        Ok(ReleaseOutcome::Created)
    }

    /// Fetch the remote `versions/` listing.
    pub fn list_remote_files(&self) -> Result<Vec<RemoteFile>, PublishError> {
        let url = format!(
            "{}/repos/{}/contents/{}?ref={}",
            self.api_base, self.repo, VERSIONS_FOLDER, GITHUB_BRANCH
        );
        let response = self.send(|| self.client.get(&url).timeout(LISTING_TIMEOUT))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Listing { status: status.as_u16() });
        }
        Ok(response.json()?)
    }

    fn put_contents(&self, name: &str, message: &str, bytes: &[u8]) -> Result<(), PublishError> {
        if self.token.is_none() {
            return Err(PublishError::MissingCredential);
        }

        let url = format!(
            "{}/repos/{}/contents/{}/{}",
            self.api_base, self.repo, VERSIONS_FOLDER, name
        );
        let request = ContentsRequest {
            message: message.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
            branch: GITHUB_BRANCH,
        };
        let response = self.send(|| self.client.put(&url).json(&request))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(%name, "upload successful");
            Ok(())
        } else {
            Err(PublishError::Upload {
                name: name.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    fn upload_asset(
        &self,
        release_id: u64,
        name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(), PublishError> {
        let url = format!(
            "{}/repos/{}/releases/{}/assets?name={}",
            self.uploads_base, self.repo, release_id, name
        );
        let response = self.send(|| {
            self.client
                .post(&url)
                .header(CONTENT_TYPE, content_type.to_string())
                .body(bytes.to_vec())
        })?;
        let status = response.status();
        if status.is_success() {
            tracing::info!(%name, "asset attached");
            Ok(())
        } else {
            Err(PublishError::Upload {
                name: name.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    /// Send a request with standard headers and the credential attached; an
    /// auth-class failure (401/403) earns one unauthenticated retry.
    fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, PublishError> {
        let with_headers = |builder: RequestBuilder| {
            builder
                .header(USER_AGENT, "bronco-backup")
                .header(ACCEPT, "application/vnd.github.v3+json")
        };

        let mut request = with_headers(build());
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }
        let response = request.send()?;

        let auth_failed = matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        );
        if auth_failed && self.token.is_some() {
            tracing::warn!(status = %response.status(), "authenticated call rejected, retrying unauthenticated");
            return Ok(with_headers(build()).send()?);
        }
        Ok(response)
    }
}

/// Zip a backup folder, with entries rooted at the folder's own name so the
/// archive extracts to a single top-level directory.
fn package_archive(folder: &Path, dest: &Path) -> Result<(), PublishError> {
    let base = folder.parent().unwrap_or(folder);
    let file = fs::File::create(dest)?;
    let mut writer = zip::ZipWriter::new(file);
    let options: zip::write::SimpleFileOptions = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    add_dir_to_zip(&mut writer, folder, base, options)?;
    writer.finish()?;
    Ok(())
}

fn add_dir_to_zip(
    writer: &mut zip::ZipWriter<fs::File>,
    dir: &Path,
    base: &Path,
    options: zip::write::SimpleFileOptions,
) -> Result<(), PublishError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            add_dir_to_zip(writer, &path, base, options)?;
        } else {
            let arcname = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            writer.start_file(arcname, options)?;
            let mut source = fs::File::open(&path)?;
            let mut buf = Vec::new();
            source.read_to_end(&mut buf)?;
            writer.write_all(&buf)?;
        }
    }
    Ok(())
}
