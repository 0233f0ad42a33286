//! Core types for metasieve.
//!
//! This module contains the shared data structures used across the workspace:
//!
//! ## Units
//! - [`CapabilityUnit`]: a loaded unit's metadata and entrypoint
//! - [`UnitStatus`]: lifecycle state of a unit
//! - [`Matcher`]: applicability predicate over files
//!
//! ## Extraction
//! - [`FileDescriptor`]: the input handed to a dispatch run
//! - [`ExtractionResult`]: merged field document plus per-unit status
//! - [`UnitReport`] / [`UnitOutcome`] / [`FailureKind`]: per-unit bookkeeping
//! - [`UpstreamResults`]: what a unit sees of its dependencies
//!
//! ## Memory
//! - [`MemorySnapshot`] / [`PressureLevel`]: point-in-time process memory
//! - [`Strategy`]: per-job execution profile (buffering and chunk sizing)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::UnitError;
use crate::traits::Entrypoint;

/// Field values are schema-free JSON; the concrete metadata vocabulary is a
/// collaborator concern.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// How many leading bytes [`FileDescriptor::from_path`] reads for content
/// sniffing.
pub const SNIFF_LEN: usize = 64;

// ============================================================================
// File Descriptors
// ============================================================================

/// Description of a file submitted for extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Absolute path to the file
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Declared MIME type, if known
    pub mime_type: Option<String>,
    /// Leading bytes of the file for matcher content sniffing (may be empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sniff: Vec<u8>,
}

impl FileDescriptor {
    /// Build a descriptor from a path: size from metadata, MIME from the
    /// extension, plus a short content sniff.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        use tokio::io::AsyncReadExt;

        let metadata = tokio::fs::metadata(path).await?;
        let mime_type = mime_guess::from_path(path).first().map(|m| m.to_string());

        let mut sniff = vec![0u8; SNIFF_LEN];
        let filled = match tokio::fs::File::open(path).await {
            Ok(mut file) => match file.read(&mut sniff).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(path = %path.display(), %err, "content sniff read failed");
                    0
                }
            },
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "content sniff open failed");
                0
            }
        };
        sniff.truncate(filled);

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            mime_type,
            sniff,
        })
    }

    /// Lowercased file extension, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
    }
}

// ============================================================================
// Matchers
// ============================================================================

/// Applicability predicate for a capability unit.
///
/// A matcher with no extensions, MIME types and magic prefixes matches every
/// file (a universal unit such as a stat reader). Otherwise any single
/// criterion accepting the descriptor is enough.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Matcher {
    /// Lowercased extensions without the leading dot
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Exact MIME type strings
    #[serde(default)]
    pub mime_types: Vec<String>,
    /// Content-sniff prefixes compared against the file's leading bytes
    #[serde(default)]
    pub magic: Vec<Vec<u8>>,
}

impl Matcher {
    /// True when this matcher accepts every file.
    #[must_use]
    pub fn is_universal(&self) -> bool {
        self.extensions.is_empty() && self.mime_types.is_empty() && self.magic.is_empty()
    }

    /// Decide whether this unit applies to the given file.
    #[must_use]
    pub fn matches(&self, file: &FileDescriptor) -> bool {
        if self.is_universal() {
            return true;
        }

        if let Some(ext) = file.extension() {
            if self.extensions.iter().any(|e| *e == ext) {
                return true;
            }
        }

        if let Some(ref mime) = file.mime_type {
            if self.mime_types.iter().any(|m| m == mime) {
                return true;
            }
        }

        self.magic
            .iter()
            .any(|prefix| !prefix.is_empty() && file.sniff.starts_with(prefix))
    }
}

// ============================================================================
// Capability Units
// ============================================================================

/// Lifecycle state of a capability unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Loaded and eligible for dispatch
    Active,
    /// Excluded from dispatch: participates in a dependency cycle
    DisabledCycle,
    /// Excluded from dispatch: manifest failed to load
    DisabledLoadError,
    /// A reload for this unit is in flight; the prior instance keeps serving
    Reloading,
}

/// A loaded capability unit: declared metadata plus a callable entrypoint.
///
/// Units are created by the registry at scan or reload time and replaced
/// wholesale; nothing mutates a published unit in place.
#[derive(Clone)]
pub struct CapabilityUnit {
    /// Unique unit name (manifest filename minus extension)
    pub name: String,
    /// Path to the unit's manifest
    pub source_path: PathBuf,
    /// blake3 over manifest bytes and mtime; used for change detection
    pub content_fingerprint: String,
    /// Applicability predicate
    pub matcher: Matcher,
    /// Names of units this unit consumes
    pub dependencies: BTreeSet<String>,
    /// Callable contract; `None` when the unit failed to load
    pub entrypoint: Option<Arc<dyn Entrypoint>>,
    /// Current lifecycle state
    pub status: UnitStatus,
    /// Captured error when status is `DisabledLoadError`
    pub load_error: Option<String>,
}

impl fmt::Debug for CapabilityUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityUnit")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("content_fingerprint", &self.content_fingerprint)
            .field("matcher", &self.matcher)
            .field("dependencies", &self.dependencies)
            .field("status", &self.status)
            .field("load_error", &self.load_error)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Upstream Results
// ============================================================================

/// What a unit observes of one direct dependency.
#[derive(Debug, Clone)]
pub enum UpstreamOutcome {
    /// Dependency succeeded; its output fields are shared read-only
    Fields(Arc<FieldMap>),
    /// Dependency failed, timed out, or was never loaded
    Failed(String),
}

/// Per-dependency outcomes handed to a unit invocation.
///
/// A failed dependency is an explicit signal, never a silent skip: the unit
/// decides whether to proceed with degraded input or fail itself via
/// [`UpstreamResults::require`].
#[derive(Debug, Clone, Default)]
pub struct UpstreamResults {
    outcomes: HashMap<String, UpstreamOutcome>,
}

impl UpstreamResults {
    /// Record one dependency outcome.
    pub fn insert(&mut self, name: impl Into<String>, outcome: UpstreamOutcome) {
        self.outcomes.insert(name.into(), outcome);
    }

    /// Outcome of a direct dependency, if it was declared.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UpstreamOutcome> {
        self.outcomes.get(name)
    }

    /// Fields of a dependency that succeeded.
    #[must_use]
    pub fn fields(&self, name: &str) -> Option<&FieldMap> {
        match self.outcomes.get(name) {
            Some(UpstreamOutcome::Fields(fields)) => Some(fields),
            _ => None,
        }
    }

    /// Fields of a dependency, failing with [`UnitError::UpstreamFailed`] when
    /// the dependency did not succeed.
    pub fn require(&self, name: &str) -> Result<&FieldMap, UnitError> {
        match self.outcomes.get(name) {
            Some(UpstreamOutcome::Fields(fields)) => Ok(fields),
            _ => Err(UnitError::UpstreamFailed {
                dependency: name.to_string(),
            }),
        }
    }

    /// Number of recorded dependency outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ============================================================================
// Extraction Results
// ============================================================================

/// Outcome classification for one unit within a dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Entrypoint returned fields
    Success,
    /// Entrypoint raised, panicked, or timed out
    Failed,
    /// Unit was matched but never attempted (disabled)
    Skipped,
}

/// Why a unit failed or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Entrypoint returned an execution error
    Execution,
    /// Per-unit timeout elapsed
    Timeout,
    /// Entrypoint panicked; contained by the dispatcher
    Panic,
    /// Unit chose to fail on a failed dependency
    UpstreamFailed,
    /// Skipped: unit is disabled by a dependency cycle
    DisabledCycle,
    /// Skipped: unit is disabled by a load error
    DisabledLoadError,
}

/// Status entry for one unit in a dispatch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    /// Unit name
    pub unit: String,
    /// Outcome classification
    pub outcome: UnitOutcome,
    /// Failure or skip reason, when not a success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    /// Human-readable error detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Wall-clock duration of the attempt (zero for skipped units)
    pub duration: Duration,
}

impl UnitReport {
    /// Report for a unit that was matched but never attempted.
    #[must_use]
    pub fn skipped(unit: impl Into<String>, kind: FailureKind, detail: Option<String>) -> Self {
        Self {
            unit: unit.into(),
            outcome: UnitOutcome::Skipped,
            kind: Some(kind),
            detail,
            duration: Duration::ZERO,
        }
    }
}

/// One merged field with the unit that contributed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldEntry {
    /// Field value
    pub value: serde_json::Value,
    /// Name of the unit that produced the value (last writer)
    pub unit: String,
}

/// The merged output of a dispatch run.
///
/// Field merging is last-writer-wins in dependency (topological) order, so
/// attribution is reproducible for an unchanged registry snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Merged field document, keyed by field name
    pub fields: BTreeMap<String, FieldEntry>,
    /// One entry per matched-and-attempted or explicitly skipped unit
    pub per_unit_status: Vec<UnitReport>,
}

impl ExtractionResult {
    /// Value of a merged field.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field).map(|entry| &entry.value)
    }

    /// Unit attributed to a merged field.
    #[must_use]
    pub fn contributed_by(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|entry| entry.unit.as_str())
    }

    /// Status entry for one unit.
    #[must_use]
    pub fn report_for(&self, unit: &str) -> Option<&UnitReport> {
        self.per_unit_status.iter().find(|r| r.unit == unit)
    }
}

// ============================================================================
// Memory Model
// ============================================================================

/// Coarse classification of available process memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Healthy,
    Warn,
    Critical,
}

/// Point-in-time view of process and system memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// When the reading was taken
    pub timestamp: DateTime<Utc>,
    /// Resident set size of this process, in bytes
    pub resident_bytes: u64,
    /// Available system memory, in bytes
    pub available_bytes: u64,
    /// Classified pressure level
    pub pressure: PressureLevel,
}

/// Per-job execution profile governing buffering and chunk sizing.
///
/// Selection is advisory: the strategy rides in [`crate::UnitContext`] and a
/// unit remains free to read the whole file regardless. That is a memory
/// risk, not a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plenty of headroom: full-buffer reads, large chunks
    Aggressive,
    /// Default profile
    Balanced,
    /// Tight memory: forced streaming with the smallest chunks
    Conservative,
}

impl Strategy {
    /// Chunk size policy for streamed reads.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        match self {
            Strategy::Aggressive => 4 * 1024 * 1024,
            Strategy::Balanced => 512 * 1024,
            Strategy::Conservative => 64 * 1024,
        }
    }

    /// Whether chunked reading should be used even for small inputs.
    #[must_use]
    pub fn forces_streaming(&self) -> bool {
        matches!(self, Strategy::Conservative)
    }
}
