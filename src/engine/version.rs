//! Version State
//!
//! Persisted major.minor.build counter with an atomic load-mutate-store
//! contract. The state document is the single source of truth; the generated
//! `version_auto.h` header and a hard-coded default are read-side fallbacks.

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// State document filename, at the project root.
const STATE_FILE: &str = ".version_state.json";

/// Generated header consumed by the firmware build.
const HEADER_FILE: &str = "src/version_auto.h";

/// Last-resort version when neither the state document nor the header parse.
const DEFAULT_VERSION: VersionTriple = VersionTriple { major: 1, minor: 3, build: 78 };

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("failed to write version state: {0}")]
    WriteState(std::io::Error),
    #[error("failed to write version header: {0}")]
    WriteHeader(std::io::Error),
    #[error("failed to serialize version state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Which component of the triple an increment bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementKind {
    Major,
    Minor,
    Build,
}

impl fmt::Display for IncrementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Build => write!(f, "build"),
        }
    }
}

/// A major.minor.build version, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl VersionTriple {
    pub fn new(major: u32, minor: u32, build: u32) -> Self {
        Self { major, minor, build }
    }

    /// Parse "X.Y.Z"; returns None for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let build = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, build })
    }

    /// The triple an increment of `kind` would produce.
    pub fn bumped(&self, kind: IncrementKind) -> Self {
        match kind {
            IncrementKind::Major => Self::new(self.major + 1, 0, 0),
            IncrementKind::Minor => Self::new(self.major, self.minor + 1, 0),
            IncrementKind::Build => Self::new(self.major, self.minor, self.build + 1),
        }
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Persisted version state: the current triple plus increment bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionState {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_increment: Option<IncrementKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl VersionState {
    fn from_triple(triple: VersionTriple) -> Self {
        Self {
            major: triple.major,
            minor: triple.minor,
            build: triple.build,
            last_increment: None,
            last_update: None,
        }
    }

    pub fn triple(&self) -> VersionTriple {
        VersionTriple::new(self.major, self.minor, self.build)
    }
}

/// Owns the on-disk version state for one project directory.
///
/// All mutation goes through [`increment`](Self::increment); the state
/// document is rewritten as a whole with a temp-file rename so a reader never
/// observes a partial write.
pub struct VersionStore {
    state_path: PathBuf,
    header_path: PathBuf,
    state: VersionState,
}

impl VersionStore {
    /// Load state from the project directory, falling back to the generated
    /// header and then to the built-in default. Never fails: a corrupt
    /// document just falls through the chain.
    pub fn load(project_dir: &Path) -> Self {
        let state_path = project_dir.join(STATE_FILE);
        let header_path = project_dir.join(HEADER_FILE);

        let state = match fs::read_to_string(&state_path) {
            Ok(content) => match serde_json::from_str::<VersionState>(strip_bom(&content)) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(path = %state_path.display(), error = %e, "corrupt version state, using fallback");
                    VersionState::from_triple(Self::fallback_version(&header_path))
                }
            },
            Err(_) => VersionState::from_triple(Self::fallback_version(&header_path)),
        };

        Self { state_path, header_path, state }
    }

    fn fallback_version(header_path: &Path) -> VersionTriple {
        if let Ok(content) = fs::read_to_string(header_path) {
            if let Some(triple) = parse_header_version(&content) {
                return triple;
            }
        }
        DEFAULT_VERSION
    }

    /// Current version triple.
    pub fn get(&self) -> VersionTriple {
        self.state.triple()
    }

    /// Bump the version and persist the new state before returning.
    ///
    /// The generated header is rewritten first; the state-document rename is
    /// the commit point. On any error the in-memory state is untouched and
    /// the increment must not be treated as applied.
    pub fn increment(&mut self, kind: IncrementKind) -> Result<VersionTriple, VersionError> {
        let next_triple = self.state.triple().bumped(kind);
        let next = VersionState {
            major: next_triple.major,
            minor: next_triple.minor,
            build: next_triple.build,
            last_increment: Some(kind),
            last_update: Some(Utc::now()),
        };

        self.write_header(next_triple)?;
        self.write_state(&next)?;

        self.state = next;
        tracing::info!(version = %next_triple, %kind, "version incremented");
        Ok(next_triple)
    }

    fn write_state(&self, state: &VersionState) -> Result<(), VersionError> {
        let content = serde_json::to_string_pretty(state)?;
        let temp_path = self.state_path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(VersionError::WriteState)?;
        fs::rename(&temp_path, &self.state_path).map_err(VersionError::WriteState)?;
        Ok(())
    }

    fn write_header(&self, version: VersionTriple) -> Result<(), VersionError> {
        if let Some(parent) = self.header_path.parent() {
            fs::create_dir_all(parent).map_err(VersionError::WriteHeader)?;
        }
        let content = format!(
            "#pragma once\n// Auto-generated on {}Z\nconstexpr const char* APP_VERSION = \"{}\";\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            version
        );
        fs::write(&self.header_path, content).map_err(VersionError::WriteHeader)
    }
}

/// Extract the version from a generated `version_auto.h`.
fn parse_header_version(content: &str) -> Option<VersionTriple> {
    let re = Regex::new(r#"APP_VERSION = "(\d+)\.(\d+)\.(\d+)""#).ok()?;
    let caps = re.captures(content)?;
    Some(VersionTriple::new(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

/// Windows editors occasionally leave a BOM on the state file.
fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}
