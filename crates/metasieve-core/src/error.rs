//! Error types for metasieve.
//!
//! Propagation policy: every error below is recovered at the dispatcher or
//! registry boundary and surfaced as structured status. Dependency cycles are
//! reported in registry snapshots, never raised; critical memory pressure is
//! a pressure classification, never an abort.

use std::time::Duration;
use thiserror::Error;

/// Main error type for metasieve operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A unit manifest failed to load
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    /// A hot reload attempt failed; the prior unit instance remains active
    #[error("reload error: {0}")]
    Reload(#[from] ReloadError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Unit manifest load errors. A failing unit is recorded as
/// `DisabledLoadError`; scanning never aborts on a single bad unit.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read manifest: {0}")]
    Read(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("unknown entrypoint id: {0}")]
    UnknownEntrypoint(String),

    #[error("invalid magic prefix {value:?}: {reason}")]
    InvalidMagic { value: String, reason: String },
}

/// Hot reload errors. The previously published unit instance stays in place.
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("reload load failure for {unit}: {source}")]
    Load {
        unit: String,
        #[source]
        source: LoadError,
    },
}

/// Errors raised inside a unit invocation. Captured by the dispatcher as a
/// per-unit FAILED outcome with error detail.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {limit:?}")]
    Timeout { limit: Duration },

    #[error("upstream dependency failed: {dependency}")]
    UpstreamFailed { dependency: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for metasieve operations.
pub type Result<T> = std::result::Result<T, Error>;
