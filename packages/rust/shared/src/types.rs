//! Core domain types for the tedsync pipeline.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Publication
// ---------------------------------------------------------------------------

/// One daily release listed in the publication calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// OJS sequence number within the year, as written in the calendar.
    pub id: String,
    /// Calendar year the publication belongs to.
    pub year: i32,
    /// Scheduled release date.
    pub release_date: NaiveDate,
}

impl Publication {
    /// Ledger token identifying this publication (`"{year}-{id}"`).
    pub fn package_token(&self) -> String {
        format!("{}-{}", self.year, self.id)
    }
}

// ---------------------------------------------------------------------------
// Package
// ---------------------------------------------------------------------------

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerFormat {
    TarGz,
    Zip,
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TarGz => write!(f, "tar.gz"),
            Self::Zip => write!(f, "zip"),
        }
    }
}

/// A downloaded (or locally supplied) archive handed to the ingestion stage.
#[derive(Debug, Clone)]
pub struct Package {
    /// Year of the publication, if known.
    pub year: Option<i32>,
    /// Publication id, if known.
    pub publication_id: Option<String>,
    /// Location of the archive on disk.
    pub local_path: PathBuf,
    /// Format inferred from the file name; `None` means "probe".
    pub container_format: Option<ContainerFormat>,
}

impl Package {
    /// Build a package for an archive already on disk (no publication metadata).
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let local_path = path.into();
        let container_format = ContainerFormat::from_file_name(&local_path);
        Self {
            year: None,
            publication_id: None,
            local_path,
            container_format,
        }
    }
}

impl ContainerFormat {
    /// Infer the format from a recognized file-name suffix.
    pub fn from_file_name(path: &std::path::Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A normalized content file, ready for bulk indexing.
///
/// The body keeps field encounter order (`serde_json` is built with
/// `preserve_order`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Index document id, derived from the source file stem.
    pub id: String,
    /// Nested field tree.
    pub body: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Per-package ingestion outcome. `indexed + failed == attempted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionResult {
    /// Content files found in the package.
    pub attempted: usize,
    /// Documents confirmed by the search engine.
    pub indexed: usize,
    /// Files that failed to normalize, load, or were never processed.
    pub failed: usize,
}

impl IngestionResult {
    /// True when every file in a non-empty package was indexed.
    pub fn is_complete(&self) -> bool {
        self.attempted > 0 && self.failed == 0
    }
}

/// Aggregate counters for a batch run over a range of years.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub downloaded: usize,
    pub indexed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Shutdown stopped the run before every year or publication was dispatched.
    pub interrupted: bool,
}

impl RunStats {
    /// Nothing failed and nothing was left undispatched.
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

impl std::ops::AddAssign for RunStats {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.downloaded += other.downloaded;
        self.indexed += other.indexed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.interrupted |= other.interrupted;
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Basic-auth credentials for the search engine.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// Username/password pair, only when both are present and non-empty.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user, pass))
            }
            _ => None,
        }
    }
}
