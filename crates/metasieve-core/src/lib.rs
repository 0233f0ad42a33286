//! # metasieve-core
//!
//! Core types and traits for metasieve, a dynamic capability-module registry
//! for per-file metadata extraction.
//!
//! This crate provides the foundational abstractions used throughout
//! metasieve:
//!
//! - **Capability units**: [`CapabilityUnit`] metadata and the [`Entrypoint`]
//!   trait every extraction unit implements
//! - **File matching**: [`Matcher`] predicates over [`FileDescriptor`]s
//! - **Results**: [`ExtractionResult`] with per-field unit attribution and a
//!   complete [`UnitReport`] list
//! - **Memory model**: [`MemorySnapshot`], [`PressureLevel`] and the per-job
//!   execution [`Strategy`]
//! - **I/O seam**: [`ExtractionIo`] and [`ByteStream`], implemented by the
//!   streaming layer and handed to units through [`UnitContext`]
//!
//! ## Architecture
//!
//! ```text
//! File -> Dispatcher -> ModuleRegistry (matching units, topo order)
//!                    -> MemoryManager  (snapshot -> Strategy)
//!                    -> CapabilityUnit entrypoints -> ExtractionResult
//! ```
//!
//! Unit internals are opaque to the core: the registry only needs a unit's
//! declared matcher, dependency names and entrypoint. Everything here is
//! schema-free: field values are plain JSON values attributed to the unit
//! that produced them.
//!
//! ## Related Crates
//!
//! - `metasieve-graph`: dependency ordering and cycle detection
//! - `metasieve-registry`: manifest scanning and snapshot publication
//! - `metasieve-dispatch`: ordered, fault-isolated execution
//! - `metasieve-memory`: streaming layer and buffer pool
//! - `metasieve-watch`: hot reload of unit manifests

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, LoadError, ReloadError, Result, UnitError};
pub use traits::{ByteStream, Entrypoint, ExtractionIo, UnitContext};
pub use types::{
    CapabilityUnit, ExtractionResult, FailureKind, FieldEntry, FieldMap, FileDescriptor, Matcher,
    MemorySnapshot, PressureLevel, Strategy, UnitOutcome, UnitReport, UnitStatus, UpstreamOutcome,
    UpstreamResults,
};
