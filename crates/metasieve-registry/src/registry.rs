//! The module registry: scanning, reloading and snapshot publication.

use metasieve_core::{
    CapabilityUnit, Entrypoint, Error, FailureKind, FileDescriptor, LoadError, ReloadError, Result,
    UnitReport, UnitStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::UNIX_EPOCH;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::manifest;

/// Recognized manifest extension in the module directory.
pub const MANIFEST_EXTENSION: &str = "toml";

/// Builder wiring entrypoint factories to a module directory.
pub struct RegistryBuilder {
    modules_dir: PathBuf,
    entrypoints: HashMap<String, Arc<dyn Entrypoint>>,
}

impl RegistryBuilder {
    /// Register an entrypoint under the id unit manifests refer to.
    #[must_use]
    pub fn with_entrypoint(mut self, id: impl Into<String>, ep: Arc<dyn Entrypoint>) -> Self {
        self.entrypoints.insert(id.into(), ep);
        self
    }

    /// Build the registry with an empty initial snapshot; call
    /// [`ModuleRegistry::scan`] to populate it.
    #[must_use]
    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            modules_dir: self.modules_dir,
            entrypoints: self.entrypoints,
            state: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            mutation: Mutex::new(()),
            reloading: StdMutex::new(BTreeSet::new()),
        }
    }
}

/// Immutable, fully-consistent view of the registry at one version.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Monotonic snapshot version; bumped on every published mutation
    pub version: u64,
    units: HashMap<String, Arc<CapabilityUnit>>,
    /// Deterministic execution order over active units
    pub topo_order: Vec<String>,
    /// Units excluded from dispatch by a dependency cycle
    pub cycle_members: BTreeSet<String>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            units: HashMap::new(),
            topo_order: Vec::new(),
            cycle_members: BTreeSet::new(),
        }
    }

    /// Look up one unit by name.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&Arc<CapabilityUnit>> {
        self.units.get(name)
    }

    /// All units, in name order.
    pub fn units(&self) -> impl Iterator<Item = &Arc<CapabilityUnit>> {
        let mut names: Vec<_> = self.units.keys().collect();
        names.sort();
        names.into_iter().map(|n| &self.units[n])
    }

    /// Number of loaded units (any status).
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units excluded from dispatch, with their reasons.
    #[must_use]
    pub fn disabled_units(&self) -> Vec<DisabledUnit> {
        let mut disabled: Vec<DisabledUnit> = self
            .units
            .values()
            .filter(|u| {
                matches!(
                    u.status,
                    UnitStatus::DisabledCycle | UnitStatus::DisabledLoadError
                )
            })
            .map(|u| DisabledUnit {
                name: u.name.clone(),
                status: u.status,
                detail: u.load_error.clone().or_else(|| {
                    Some(format!(
                        "dependency cycle involving: {}",
                        join_names(&self.cycle_members)
                    ))
                }),
            })
            .collect();
        disabled.sort_by(|a, b| a.name.cmp(&b.name));
        disabled
    }

    /// Active units whose matcher accepts the file, plus their transitive
    /// active dependencies, in topological order, together with skip reports
    /// for matched-but-disabled units.
    ///
    /// Units whose matcher rejects the file are not listed at all; the
    /// returned set (and the per-unit status built from it) covers only
    /// matched units.
    #[must_use]
    pub fn find_matching(&self, file: &FileDescriptor) -> MatchSet {
        let mut selected: BTreeSet<&str> = BTreeSet::new();
        let mut skipped = Vec::new();

        for unit in self.units.values() {
            if !unit.matcher.matches(file) {
                continue;
            }
            match unit.status {
                UnitStatus::Active => {
                    selected.insert(unit.name.as_str());
                }
                UnitStatus::DisabledCycle => skipped.push(UnitReport::skipped(
                    &unit.name,
                    FailureKind::DisabledCycle,
                    Some(format!(
                        "dependency cycle involving: {}",
                        join_names(&self.cycle_members)
                    )),
                )),
                UnitStatus::DisabledLoadError => skipped.push(UnitReport::skipped(
                    &unit.name,
                    FailureKind::DisabledLoadError,
                    unit.load_error.clone(),
                )),
                // Not published in snapshots; defensive arm only.
                UnitStatus::Reloading => {}
            }
        }

        // Pull in transitive active dependencies of the matched set.
        let mut queue: Vec<&str> = selected.iter().copied().collect();
        while let Some(name) = queue.pop() {
            let Some(unit) = self.units.get(name) else {
                continue;
            };
            for dep in &unit.dependencies {
                if let Some(dep_unit) = self.units.get(dep.as_str()) {
                    if dep_unit.status == UnitStatus::Active
                        && selected.insert(dep_unit.name.as_str())
                    {
                        queue.push(dep_unit.name.as_str());
                    }
                }
            }
        }

        let runnable: Vec<Arc<CapabilityUnit>> = self
            .topo_order
            .iter()
            .filter(|name| selected.contains(name.as_str()))
            .map(|name| Arc::clone(&self.units[name]))
            .collect();

        skipped.sort_by(|a, b| a.unit.cmp(&b.unit));
        MatchSet { runnable, skipped }
    }
}

/// Result of [`RegistrySnapshot::find_matching`].
#[derive(Debug)]
pub struct MatchSet {
    /// Units to execute, in dependency order
    pub runnable: Vec<Arc<CapabilityUnit>>,
    /// Matched-but-disabled units, as ready-made skip reports
    pub skipped: Vec<UnitReport>,
}

/// One disabled unit on the observability surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisabledUnit {
    pub name: String,
    pub status: UnitStatus,
    pub detail: Option<String>,
}

/// Summary of a directory scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Manifests discovered
    pub total: usize,
    /// Units loaded and active
    pub active: usize,
    /// Units that failed to load, with captured errors
    pub load_errors: Vec<(String, String)>,
    /// Units disabled by dependency cycles
    pub cycle_members: BTreeSet<String>,
    /// Version of the published snapshot
    pub version: u64,
}

/// Result of a single-unit reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Fingerprint unchanged; nothing republished
    Unchanged,
    /// Existing unit replaced atomically
    Reloaded { version: u64 },
    /// Unit was not previously loaded and has been added
    Added { version: u64 },
}

/// Registry of capability units backed by a module directory.
///
/// All mutation funnels through `scan` / `reload_unit` / `unregister`; each
/// acquires the mutation lock, builds a complete snapshot and publishes it
/// with a single pointer swap. Readers clone the current `Arc` under a short
/// read lock and are never blocked by mutation in progress.
pub struct ModuleRegistry {
    modules_dir: PathBuf,
    entrypoints: HashMap<String, Arc<dyn Entrypoint>>,
    state: RwLock<Arc<RegistrySnapshot>>,
    mutation: Mutex<()>,
    reloading: StdMutex<BTreeSet<String>>,
}

impl ModuleRegistry {
    /// Start building a registry over the given module directory.
    #[must_use]
    pub fn builder(modules_dir: impl Into<PathBuf>) -> RegistryBuilder {
        RegistryBuilder {
            modules_dir: modules_dir.into(),
            entrypoints: HashMap::new(),
        }
    }

    /// The module directory this registry scans.
    #[must_use]
    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Current snapshot. Cheap; safe to hold across a whole dispatch run.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.state.read().await)
    }

    /// Status of one unit, overlaying `Reloading` while a reload for it is in
    /// flight.
    pub async fn unit_status(&self, name: &str) -> Option<UnitStatus> {
        if self
            .reloading
            .lock()
            .expect("reloading set lock poisoned")
            .contains(name)
        {
            return Some(UnitStatus::Reloading);
        }
        self.snapshot().await.unit(name).map(|u| u.status)
    }

    /// Disabled units with error details, for external monitoring.
    pub async fn disabled_units(&self) -> Vec<DisabledUnit> {
        self.snapshot().await.disabled_units()
    }

    /// Discover and load every unit manifest in the module directory.
    ///
    /// A unit that fails to load is recorded `DisabledLoadError` with the
    /// captured error; the scan itself only fails when the directory cannot
    /// be listed.
    pub async fn scan(&self) -> Result<ScanReport> {
        let _guard = self.mutation.lock().await;

        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.modules_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            names.push((stem.to_string(), path));
        }
        names.sort();

        let mut units = HashMap::with_capacity(names.len());
        let mut load_errors = Vec::new();
        for (name, path) in &names {
            match self.try_load(name, path).await {
                Ok(unit) => {
                    units.insert(name.clone(), Arc::new(unit));
                }
                Err(e) => {
                    warn!(unit = %name, error = %e, "unit failed to load");
                    load_errors.push((name.clone(), e.to_string()));
                    units.insert(name.clone(), Arc::new(disabled_unit(name, path, &e)));
                }
            }
        }

        let snapshot = self.publish(units).await;
        let active = snapshot
            .units
            .values()
            .filter(|u| u.status == UnitStatus::Active)
            .count();
        info!(
            total = names.len(),
            active,
            failed = load_errors.len(),
            cyclic = snapshot.cycle_members.len(),
            version = snapshot.version,
            "module scan complete"
        );

        Ok(ScanReport {
            total: names.len(),
            active,
            load_errors,
            cycle_members: snapshot.cycle_members.clone(),
            version: snapshot.version,
        })
    }

    /// Re-read and replace exactly one unit.
    ///
    /// An unchanged fingerprint short-circuits with no rebuild; a load
    /// failure leaves the previously published instance in place.
    pub async fn reload_unit(&self, name: &str) -> Result<ReloadOutcome> {
        let _guard = self.mutation.lock().await;
        let _flag = ReloadingFlag::set(&self.reloading, name);
        self.reload_inner(name).await
    }

    async fn reload_inner(&self, name: &str) -> Result<ReloadOutcome> {
        let current = self.snapshot().await;
        let existing = current.unit(name);
        let path = existing.map_or_else(
            || self.modules_dir.join(format!("{name}.{MANIFEST_EXTENSION}")),
            |u| u.source_path.clone(),
        );

        if existing.is_none() && !path.is_file() {
            return Err(Error::Reload(ReloadError::UnknownUnit(name.to_string())));
        }

        // Fingerprint check before the full load: identical source is a
        // no-op with no visible rebuild.
        if let Some(prev) = existing {
            if let Ok((bytes, mtime)) = read_with_mtime(&path).await {
                if manifest::fingerprint(&bytes, mtime) == prev.content_fingerprint {
                    debug!(unit = %name, "reload skipped, fingerprint unchanged");
                    return Ok(ReloadOutcome::Unchanged);
                }
            }
        }

        let unit = self.try_load(name, &path).await.map_err(|source| {
            Error::Reload(ReloadError::Load {
                unit: name.to_string(),
                source,
            })
        })?;

        let was_known = existing.is_some();
        let mut units = current.units.clone();
        units.insert(name.to_string(), Arc::new(unit));
        let snapshot = self.publish(units).await;
        info!(unit = %name, version = snapshot.version, "unit reloaded");

        Ok(if was_known {
            ReloadOutcome::Reloaded {
                version: snapshot.version,
            }
        } else {
            ReloadOutcome::Added {
                version: snapshot.version,
            }
        })
    }

    /// Remove one unit and rebuild the graph.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let current = self.snapshot().await;
        if current.unit(name).is_none() {
            return Err(Error::Reload(ReloadError::UnknownUnit(name.to_string())));
        }
        let mut units = current.units.clone();
        units.remove(name);
        let snapshot = self.publish(units).await;
        info!(unit = %name, version = snapshot.version, "unit unregistered");
        Ok(())
    }

    /// Load one manifest into an active unit.
    async fn try_load(&self, name: &str, path: &Path) -> std::result::Result<CapabilityUnit, LoadError> {
        let (bytes, mtime) = read_with_mtime(path).await?;
        let fingerprint = manifest::fingerprint(&bytes, mtime);
        let text = String::from_utf8(bytes)
            .map_err(|e| LoadError::Parse(format!("manifest is not utf-8: {e}")))?;
        let parsed = manifest::parse(&text)?;

        let entrypoint = self
            .entrypoints
            .get(&parsed.entrypoint)
            .cloned()
            .ok_or_else(|| LoadError::UnknownEntrypoint(parsed.entrypoint.clone()))?;

        Ok(CapabilityUnit {
            name: name.to_string(),
            source_path: path.to_path_buf(),
            content_fingerprint: fingerprint,
            matcher: parsed.matcher,
            dependencies: parsed.dependencies,
            entrypoint: Some(entrypoint),
            status: UnitStatus::Active,
            load_error: None,
        })
    }

    /// Rebuild the dependency graph over the given units and publish a new
    /// snapshot. Cycle-derived statuses are recomputed from scratch.
    async fn publish(&self, units: HashMap<String, Arc<CapabilityUnit>>) -> Arc<RegistrySnapshot> {
        let nodes: BTreeMap<String, BTreeSet<String>> = units
            .values()
            .filter(|u| u.entrypoint.is_some())
            .map(|u| (u.name.clone(), u.dependencies.clone()))
            .collect();
        let graph = metasieve_graph::build(&nodes);

        let units: HashMap<String, Arc<CapabilityUnit>> = units
            .into_iter()
            .map(|(name, unit)| {
                let status = if unit.entrypoint.is_none() {
                    UnitStatus::DisabledLoadError
                } else if graph.cycle_members.contains(&name) {
                    UnitStatus::DisabledCycle
                } else {
                    UnitStatus::Active
                };
                if unit.status == status {
                    (name, unit)
                } else {
                    let mut updated = (*unit).clone();
                    updated.status = status;
                    (name, Arc::new(updated))
                }
            })
            .collect();

        let mut state = self.state.write().await;
        let snapshot = Arc::new(RegistrySnapshot {
            version: state.version + 1,
            units,
            topo_order: graph.topo_order,
            cycle_members: graph.cycle_members,
        });
        *state = Arc::clone(&snapshot);
        snapshot
    }
}

/// Marks a unit as reloading for the lifetime of the guard. Clearing on drop
/// keeps `unit_status` accurate even when the reload future is cancelled
/// mid-flight.
struct ReloadingFlag<'a> {
    set: &'a StdMutex<BTreeSet<String>>,
    name: String,
}

impl<'a> ReloadingFlag<'a> {
    fn set(set: &'a StdMutex<BTreeSet<String>>, name: &str) -> Self {
        set.lock()
            .expect("reloading set lock poisoned")
            .insert(name.to_string());
        Self {
            set,
            name: name.to_string(),
        }
    }
}

impl Drop for ReloadingFlag<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.name);
        }
    }
}

fn disabled_unit(name: &str, path: &Path, error: &LoadError) -> CapabilityUnit {
    CapabilityUnit {
        name: name.to_string(),
        source_path: path.to_path_buf(),
        content_fingerprint: String::new(),
        matcher: metasieve_core::Matcher::default(),
        dependencies: BTreeSet::new(),
        entrypoint: None,
        status: UnitStatus::DisabledLoadError,
        load_error: Some(error.to_string()),
    }
}

async fn read_with_mtime(path: &Path) -> std::result::Result<(Vec<u8>, std::time::SystemTime), LoadError> {
    let bytes = tokio::fs::read(path).await.map_err(LoadError::Read)?;
    let metadata = tokio::fs::metadata(path).await.map_err(LoadError::Read)?;
    let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
    Ok((bytes, mtime))
}

fn join_names(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metasieve_core::{FieldMap, UnitContext, UnitError};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct NoopEntrypoint;

    #[async_trait]
    impl Entrypoint for NoopEntrypoint {
        async fn run(&self, _ctx: &UnitContext) -> std::result::Result<FieldMap, UnitError> {
            Ok(FieldMap::new())
        }
    }

    fn write_manifest(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(format!("{name}.toml"));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn test_registry(dir: &TempDir) -> ModuleRegistry {
        ModuleRegistry::builder(dir.path())
            .with_entrypoint("noop", Arc::new(NoopEntrypoint))
            .build()
    }

    fn descriptor(path: &str) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            size_bytes: 10,
            mime_type: mime_guess::from_path(path).first().map(|m| m.to_string()),
            sniff: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_scan_loads_units() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");
        write_manifest(
            &dir,
            "exif",
            "entrypoint = \"noop\"\ndependencies = [\"stat\"]\n",
        );

        let registry = test_registry(&dir);
        let report = registry.scan().await.unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.active, 2);
        assert!(report.load_errors.is_empty());
        assert_eq!(report.version, 1);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.topo_order, vec!["stat", "exif"]);
    }

    #[tokio::test]
    async fn test_scan_records_load_error_without_aborting() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "good", "entrypoint = \"noop\"\n");
        write_manifest(&dir, "broken", "entrypoint = \n");
        write_manifest(&dir, "orphan", "entrypoint = \"no-such-factory\"\n");

        let registry = test_registry(&dir);
        let report = registry.scan().await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.active, 1);
        assert_eq!(report.load_errors.len(), 2);

        let disabled = registry.disabled_units().await;
        assert_eq!(disabled.len(), 2);
        assert!(disabled
            .iter()
            .all(|d| d.status == UnitStatus::DisabledLoadError));
        assert!(disabled
            .iter()
            .any(|d| d.detail.as_deref().unwrap_or("").contains("no-such-factory")));
    }

    #[tokio::test]
    async fn test_scan_marks_cycles_disabled() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "a", "entrypoint = \"noop\"\n");
        write_manifest(&dir, "b", "entrypoint = \"noop\"\ndependencies = [\"a\"]\n");
        write_manifest(&dir, "c", "entrypoint = \"noop\"\ndependencies = [\"d\"]\n");
        write_manifest(&dir, "d", "entrypoint = \"noop\"\ndependencies = [\"c\"]\n");

        let registry = test_registry(&dir);
        let report = registry.scan().await.unwrap();

        assert_eq!(report.active, 2);
        assert_eq!(
            report.cycle_members,
            ["c", "d"].iter().map(|s| s.to_string()).collect()
        );

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.topo_order, vec!["a", "b"]);
        assert_eq!(
            snapshot.unit("c").unwrap().status,
            UnitStatus::DisabledCycle
        );
    }

    #[tokio::test]
    async fn test_scan_ignores_non_manifest_files() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "real", "entrypoint = \"noop\"\n");
        std::fs::write(dir.path().join("notes.txt"), "not a unit").unwrap();
        std::fs::write(dir.path().join(".hidden.toml"), "entrypoint = \"noop\"").unwrap();

        let registry = test_registry(&dir);
        let report = registry.scan().await.unwrap();
        assert_eq!(report.total, 1);
    }

    #[tokio::test]
    async fn test_find_matching_orders_and_skips() {
        let dir = TempDir::new().unwrap();
        // "stat" is universal; "exif" matches jpg and depends on stat;
        // cyclic pair matches jpg too and must surface as skipped.
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");
        write_manifest(
            &dir,
            "exif",
            "entrypoint = \"noop\"\ndependencies = [\"stat\"]\n[matcher]\nextensions = [\"jpg\"]\n",
        );
        write_manifest(&dir, "c", "entrypoint = \"noop\"\ndependencies = [\"d\"]\n");
        write_manifest(&dir, "d", "entrypoint = \"noop\"\ndependencies = [\"c\"]\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        let snapshot = registry.snapshot().await;

        let matched = snapshot.find_matching(&descriptor("/photos/cat.jpg"));
        let names: Vec<_> = matched.runnable.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["stat", "exif"]);
        assert_eq!(matched.skipped.len(), 2);
        assert!(matched
            .skipped
            .iter()
            .all(|r| r.kind == Some(FailureKind::DisabledCycle)));

        // Non-jpg file: only the universal unit runs.
        let matched = snapshot.find_matching(&descriptor("/docs/readme.txt"));
        let names: Vec<_> = matched.runnable.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["stat"]);
    }

    #[tokio::test]
    async fn test_find_matching_pulls_in_unmatched_dependencies() {
        let dir = TempDir::new().unwrap();
        // "meta" matches jpg only through its own matcher; its dependency
        // "base" matches nothing by itself but must still run first.
        write_manifest(
            &dir,
            "base",
            "entrypoint = \"noop\"\n[matcher]\nextensions = [\"none\"]\n",
        );
        write_manifest(
            &dir,
            "meta",
            "entrypoint = \"noop\"\ndependencies = [\"base\"]\n[matcher]\nextensions = [\"jpg\"]\n",
        );

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        let snapshot = registry.snapshot().await;

        let matched = snapshot.find_matching(&descriptor("/x.jpg"));
        let names: Vec<_> = matched.runnable.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["base", "meta"]);
    }

    #[tokio::test]
    async fn test_reload_unchanged_fingerprint_is_noop() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        let before = registry.snapshot().await;

        let outcome = registry.reload_unit("stat").await.unwrap();
        assert_eq!(outcome, ReloadOutcome::Unchanged);

        let after = registry.snapshot().await;
        assert_eq!(before.version, after.version);
        assert_eq!(
            before.unit("stat").unwrap().content_fingerprint,
            after.unit("stat").unwrap().content_fingerprint
        );
    }

    #[tokio::test]
    async fn test_reload_with_new_dependencies_updates_topo() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "alpha", "entrypoint = \"noop\"\n");
        let exif_path = write_manifest(&dir, "exif", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        assert_eq!(
            registry.snapshot().await.topo_order,
            vec!["alpha", "exif"]
        );

        // Rewrite with a dependency; ensure the mtime moves.
        std::fs::write(
            &exif_path,
            "entrypoint = \"noop\"\ndependencies = [\"alpha\"]\n# rev2\n",
        )
        .unwrap();

        let outcome = registry.reload_unit("exif").await.unwrap();
        assert!(matches!(outcome, ReloadOutcome::Reloaded { version: 2 }));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.topo_order, vec!["alpha", "exif"]);
        assert_eq!(
            snapshot.unit("exif").unwrap().dependencies.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_instance() {
        let dir = TempDir::new().unwrap();
        let path = write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        let fingerprint_before = registry
            .snapshot()
            .await
            .unit("stat")
            .unwrap()
            .content_fingerprint
            .clone();

        std::fs::write(&path, "entrypoint = \n").unwrap();
        let err = registry.reload_unit("stat").await.unwrap_err();
        assert!(matches!(err, Error::Reload(ReloadError::Load { .. })));

        let snapshot = registry.snapshot().await;
        let unit = snapshot.unit("stat").unwrap();
        assert_eq!(unit.status, UnitStatus::Active);
        assert_eq!(unit.content_fingerprint, fingerprint_before);
    }

    #[tokio::test]
    async fn test_reload_adds_new_unit() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();

        write_manifest(&dir, "fresh", "entrypoint = \"noop\"\n");
        let outcome = registry.reload_unit("fresh").await.unwrap();
        assert!(matches!(outcome, ReloadOutcome::Added { .. }));
        assert!(registry.snapshot().await.unit("fresh").is_some());
    }

    #[tokio::test]
    async fn test_reload_unknown_unit() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(&dir);
        registry.scan().await.unwrap();

        let err = registry.reload_unit("ghost").await.unwrap_err();
        assert!(matches!(err, Error::Reload(ReloadError::UnknownUnit(_))));
    }

    #[tokio::test]
    async fn test_unregister_rebuilds_graph() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "a", "entrypoint = \"noop\"\n");
        write_manifest(&dir, "b", "entrypoint = \"noop\"\ndependencies = [\"a\"]\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();
        registry.unregister("a").await.unwrap();

        let snapshot = registry.snapshot().await;
        assert!(snapshot.unit("a").is_none());
        // "b" survives; its missing dependency surfaces at dispatch time.
        assert_eq!(snapshot.topo_order, vec!["b"]);

        assert!(registry.unregister("a").await.is_err());
    }

    #[tokio::test]
    async fn test_inflight_snapshot_unaffected_by_mutation() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();

        let held = registry.snapshot().await;
        registry.unregister("stat").await.unwrap();

        // The held snapshot still sees the unit; new readers do not.
        assert!(held.unit("stat").is_some());
        assert!(registry.snapshot().await.unit("stat").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_reload_clears_reloading_status() {
        use std::future::Future;

        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();

        // Poll a reload partway (far enough to mark the unit reloading),
        // then drop it before completion.
        {
            let mut fut = Box::pin(registry.reload_unit("stat"));
            let mut done = false;
            for _ in 0..3 {
                std::future::poll_fn(|cx| {
                    if !done {
                        done = fut.as_mut().poll(cx).is_ready();
                    }
                    std::task::Poll::Ready(())
                })
                .await;
                if done {
                    break;
                }
            }
        }

        // The abandoned reload must not leave the unit stuck in Reloading.
        assert_eq!(
            registry.unit_status("stat").await,
            Some(UnitStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_unit_status_lookup() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir, "stat", "entrypoint = \"noop\"\n");

        let registry = test_registry(&dir);
        registry.scan().await.unwrap();

        assert_eq!(
            registry.unit_status("stat").await,
            Some(UnitStatus::Active)
        );
        assert_eq!(registry.unit_status("ghost").await, None);
    }
}
