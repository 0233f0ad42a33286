//! # metasieve-watch
//!
//! Hot reload of capability unit manifests.
//!
//! [`HotReloadWatcher`] observes the registry's module directory through a
//! debounced filesystem watcher. A burst of writes to one manifest collapses
//! into a single reload of the post-quiet-period content; a deleted manifest
//! unregisters its unit. Reload outcomes are rebroadcast so callers (CLI
//! status output, tests) can observe them.
//!
//! On platforms where the native watcher cannot start, the component degrades
//! to an inert handle: a single warning is logged, [`is_active`] returns
//! `false`, and registry reloads remain available through the explicit
//! [`ModuleRegistry::reload_unit`] path.
//!
//! [`is_active`]: HotReloadWatcher::is_active

use metasieve_registry::{ModuleRegistry, ReloadOutcome, MANIFEST_EXTENSION};
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache,
};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc as tokio_mpsc};
use tracing::{debug, error, info, warn};

/// Default quiet period before a manifest change is applied.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// A manifest-level change derived from raw filesystem events.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ManifestEvent {
    /// Manifest written or created; the unit should be (re)loaded
    Changed(String),
    /// Manifest removed; the unit should be unregistered
    Removed(String),
}

/// Outcome of one applied manifest change, broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadUpdate {
    Reloaded { unit: String, version: u64 },
    Added { unit: String, version: u64 },
    Unchanged { unit: String },
    Removed { unit: String },
    Failed { unit: String, detail: String },
}

/// Debounced watcher driving registry reloads.
///
/// Dropping the watcher stops the native watch and the reload driver.
pub struct HotReloadWatcher {
    updates: broadcast::Sender<ReloadUpdate>,
    active: bool,
    _debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl HotReloadWatcher {
    /// Start watching the registry's module directory.
    ///
    /// Must be called from within a tokio runtime. Never fails: watcher
    /// startup errors leave an inactive handle behind.
    pub fn start(registry: Arc<ModuleRegistry>, debounce: Duration) -> Self {
        let (updates, _) = broadcast::channel(64);

        let (raw_tx, raw_rx) = mpsc::channel();
        let mut debouncer = match new_debouncer(debounce, None, move |result| {
            let _ = raw_tx.send(result);
        }) {
            Ok(d) => d,
            Err(e) => {
                warn!("hot reload unavailable, manifest changes require an explicit rescan: {e}");
                return Self {
                    updates,
                    active: false,
                    _debouncer: None,
                };
            }
        };

        let dir = registry.modules_dir().to_path_buf();
        if let Err(e) = debouncer.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(
                dir = %dir.display(),
                "hot reload unavailable, manifest changes require an explicit rescan: {e}"
            );
            return Self {
                updates,
                active: false,
                _debouncer: None,
            };
        }

        // Bridge thread: the debouncer delivers on a std channel, the driver
        // task consumes from a tokio one.
        let (event_tx, event_rx) = tokio_mpsc::channel(64);
        std::thread::spawn(move || {
            while let Ok(result) = raw_rx.recv() {
                if forward_debounced(result, &event_tx).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(drive_reloads(registry, event_rx, updates.clone()));
        info!(dir = %dir.display(), ?debounce, "watching module directory");

        Self {
            updates,
            active: true,
            _debouncer: Some(debouncer),
        }
    }

    /// Whether the native watcher is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Subscribe to reload outcomes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadUpdate> {
        self.updates.subscribe()
    }
}

/// Convert debounced results and push them over the async channel.
///
/// Returns `Err` once the driver side is gone so the bridge thread can exit.
fn forward_debounced(
    result: DebounceEventResult,
    event_tx: &tokio_mpsc::Sender<ManifestEvent>,
) -> Result<(), ()> {
    match result {
        Ok(events) => {
            for event in events {
                for manifest_event in convert_event(&event) {
                    // Blocking send: this runs on the bridge thread.
                    if event_tx.blocking_send(manifest_event).is_err() {
                        return Err(());
                    }
                }
            }
            Ok(())
        }
        Err(errors) => {
            for e in errors {
                error!("watch error: {e}");
            }
            Ok(())
        }
    }
}

/// Map one filesystem event to manifest-level changes.
///
/// Non-manifest paths and dotfiles produce nothing. A rename carrying both
/// paths removes the old unit and loads the new one.
fn convert_event(event: &DebouncedEvent) -> Vec<ManifestEvent> {
    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            let mut out = Vec::new();
            if event.paths.len() >= 2 {
                if let Some(from) = unit_name(&event.paths[0]) {
                    out.push(ManifestEvent::Removed(from));
                }
                if let Some(to) = unit_name(&event.paths[1]) {
                    out.push(ManifestEvent::Changed(to));
                }
            } else if let Some(name) = event.paths.first().and_then(|p| unit_name(p)) {
                out.push(ManifestEvent::Changed(name));
            }
            out
        }
        EventKind::Remove(_) => event
            .paths
            .first()
            .and_then(|p| unit_name(p))
            .map(ManifestEvent::Removed)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Unit name for a manifest path, `None` for anything the scanner ignores.
fn unit_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

async fn drive_reloads(
    registry: Arc<ModuleRegistry>,
    mut events: tokio_mpsc::Receiver<ManifestEvent>,
    updates: broadcast::Sender<ReloadUpdate>,
) {
    while let Some(event) = events.recv().await {
        let update = apply_event(&registry, event).await;
        if let Some(update) = update {
            debug!(?update, "manifest change applied");
            // No subscribers is fine; updates are advisory.
            let _ = updates.send(update);
        }
    }
    debug!("reload driver stopped");
}

async fn apply_event(registry: &ModuleRegistry, event: ManifestEvent) -> Option<ReloadUpdate> {
    match event {
        ManifestEvent::Changed(unit) => match registry.reload_unit(&unit).await {
            Ok(ReloadOutcome::Reloaded { version }) => {
                Some(ReloadUpdate::Reloaded { unit, version })
            }
            Ok(ReloadOutcome::Added { version }) => Some(ReloadUpdate::Added { unit, version }),
            Ok(ReloadOutcome::Unchanged) => Some(ReloadUpdate::Unchanged { unit }),
            Err(e) => {
                warn!(unit = %unit, "reload failed: {e}");
                Some(ReloadUpdate::Failed {
                    unit,
                    detail: e.to_string(),
                })
            }
        },
        ManifestEvent::Removed(unit) => match registry.unregister(&unit).await {
            Ok(()) => Some(ReloadUpdate::Removed { unit }),
            Err(e) => {
                // Removal of a manifest that never loaded is not actionable.
                debug!(unit = %unit, "unregister skipped: {e}");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metasieve_core::{Entrypoint, FieldMap, UnitContext, UnitError, UnitStatus};
    use notify_debouncer_full::notify::event::{CreateKind, ModifyKind, RemoveKind};
    use notify_debouncer_full::notify::Event;
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::TempDir;

    struct NoopEntrypoint;

    #[async_trait]
    impl Entrypoint for NoopEntrypoint {
        async fn run(&self, _ctx: &UnitContext) -> Result<FieldMap, UnitError> {
            Ok(FieldMap::new())
        }
    }

    fn make_event(kind: EventKind, paths: Vec<PathBuf>) -> DebouncedEvent {
        DebouncedEvent {
            event: Event {
                kind,
                paths,
                attrs: Default::default(),
            },
            time: Instant::now(),
        }
    }

    #[test]
    fn test_convert_create_and_modify() {
        for kind in [
            EventKind::Create(CreateKind::File),
            EventKind::Modify(ModifyKind::Any),
        ] {
            let event = make_event(kind, vec![PathBuf::from("/mods/exif.toml")]);
            assert_eq!(
                convert_event(&event),
                vec![ManifestEvent::Changed("exif".to_string())]
            );
        }
    }

    #[test]
    fn test_convert_remove() {
        let event = make_event(
            EventKind::Remove(RemoveKind::File),
            vec![PathBuf::from("/mods/exif.toml")],
        );
        assert_eq!(
            convert_event(&event),
            vec![ManifestEvent::Removed("exif".to_string())]
        );
    }

    #[test]
    fn test_convert_rename_removes_old_loads_new() {
        let event = make_event(
            EventKind::Modify(ModifyKind::Name(
                notify_debouncer_full::notify::event::RenameMode::Both,
            )),
            vec![
                PathBuf::from("/mods/old.toml"),
                PathBuf::from("/mods/new.toml"),
            ],
        );
        assert_eq!(
            convert_event(&event),
            vec![
                ManifestEvent::Removed("old".to_string()),
                ManifestEvent::Changed("new".to_string()),
            ]
        );
    }

    #[test]
    fn test_convert_ignores_non_manifests_and_dotfiles() {
        for path in ["/mods/readme.md", "/mods/.hidden.toml", "/mods/unit.toml~"] {
            let event = make_event(EventKind::Create(CreateKind::File), vec![PathBuf::from(path)]);
            assert!(convert_event(&event).is_empty(), "{path}");
        }
    }

    async fn registry_with(dir: &TempDir, manifests: &[(&str, &str)]) -> Arc<ModuleRegistry> {
        for (name, body) in manifests {
            std::fs::write(dir.path().join(format!("{name}.toml")), body).unwrap();
        }
        let registry = Arc::new(
            ModuleRegistry::builder(dir.path())
                .with_entrypoint("noop", Arc::new(NoopEntrypoint))
                .build(),
        );
        registry.scan().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_apply_changed_reloads_unit() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, &[("exif", "entrypoint = \"noop\"\n")]).await;

        std::fs::write(
            dir.path().join("exif.toml"),
            "entrypoint = \"noop\"\ndependencies = []\n",
        )
        .unwrap();
        let update = apply_event(&registry, ManifestEvent::Changed("exif".to_string())).await;
        assert!(matches!(update, Some(ReloadUpdate::Reloaded { .. })));
    }

    #[tokio::test]
    async fn test_apply_changed_adds_new_unit() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, &[]).await;

        std::fs::write(dir.path().join("fresh.toml"), "entrypoint = \"noop\"\n").unwrap();
        let update = apply_event(&registry, ManifestEvent::Changed("fresh".to_string())).await;
        assert!(matches!(update, Some(ReloadUpdate::Added { .. })));
        assert_eq!(
            registry.unit_status("fresh").await,
            Some(UnitStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_apply_removed_unregisters() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, &[("gone", "entrypoint = \"noop\"\n")]).await;

        let update = apply_event(&registry, ManifestEvent::Removed("gone".to_string())).await;
        assert_eq!(
            update,
            Some(ReloadUpdate::Removed {
                unit: "gone".to_string()
            })
        );
        assert_eq!(registry.unit_status("gone").await, None);
    }

    #[tokio::test]
    async fn test_apply_removed_unknown_is_silent() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, &[]).await;

        let update = apply_event(&registry, ManifestEvent::Removed("ghost".to_string())).await;
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn test_watcher_end_to_end_reload() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, &[("live", "entrypoint = \"noop\"\n")]).await;

        let watcher = HotReloadWatcher::start(Arc::clone(&registry), Duration::from_millis(50));
        if !watcher.is_active() {
            // Platform without watch support; degraded mode is the contract.
            return;
        }
        let mut updates = watcher.subscribe();

        std::fs::write(
            dir.path().join("live.toml"),
            "entrypoint = \"noop\"\ndependencies = []\n",
        )
        .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("debounced reload within the timeout")
            .expect("watcher alive");
        assert!(matches!(
            update,
            ReloadUpdate::Reloaded { ref unit, .. } if unit == "live"
        ));
    }
}
