//! # metasieve-registry
//!
//! Discovery and lifecycle management for capability units.
//!
//! The [`ModuleRegistry`] scans a module directory for unit manifests, loads
//! them against the host's registered entrypoints, and publishes immutable
//! [`RegistrySnapshot`]s. Registry mutation ([`scan`](ModuleRegistry::scan),
//! [`reload_unit`](ModuleRegistry::reload_unit),
//! [`unregister`](ModuleRegistry::unregister)) is the only mutable state in
//! the subsystem: each mutation is serialized, builds a complete new snapshot
//! (dependency graph included) and swaps it in atomically. Readers always
//! hold a consistent snapshot `Arc`; dispatch runs already in flight keep the
//! snapshot they started with.
//!
//! A unit that fails to load is recorded `DisabledLoadError` with the
//! captured error and never aborts the scan; units on dependency cycles are
//! recorded `DisabledCycle` and excluded from dispatch, queryable via
//! [`ModuleRegistry::disabled_units`].

pub mod manifest;
mod registry;

pub use manifest::UnitManifest;
pub use registry::{
    DisabledUnit, MatchSet, ModuleRegistry, RegistryBuilder, RegistrySnapshot, ReloadOutcome,
    ScanReport, MANIFEST_EXTENSION,
};
