//! # metasieve-dispatch
//!
//! Executes matching capability units against one file: dependency order is
//! enforced through per-unit completion signals, independent units run
//! concurrently up to a bounded worker count, and every per-unit failure
//! (error, panic or timeout) is captured as a structured outcome that never
//! crosses the dispatch boundary.
//!
//! ## Execution model
//!
//! Each runnable unit becomes one tokio task. A task first awaits the
//! completion signals of its direct dependencies (and only those), then takes
//! a semaphore permit and invokes the unit's entrypoint under the per-unit
//! timeout. Failed dependencies are delivered as explicit upstream-failed
//! signals; the unit decides whether to proceed degraded or fail itself.
//!
//! Successful outputs merge last-writer-wins in topological order, recording
//! which unit contributed each field, so attribution is reproducible for an
//! unchanged registry snapshot.
//!
//! Dropping the future returned by [`Dispatcher::extract`] (for example on
//! client disconnect) aborts all still-running unit tasks; pooled buffers
//! held by streams return to the pool through their drop handlers.

use metasieve_core::{
    ExtractionIo, ExtractionResult, FailureKind, FieldEntry, FieldMap, FileDescriptor, Strategy,
    UnitContext, UnitError, UnitOutcome, UnitReport, UpstreamOutcome, UpstreamResults,
};
use metasieve_memory::{MemoryManager, StreamingLayer};
use metasieve_registry::{MatchSet, ModuleRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrently executing units per job
    pub max_concurrent: usize,
    /// Hard per-unit timeout
    pub unit_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            unit_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-job extraction driver.
pub struct Dispatcher {
    registry: Arc<ModuleRegistry>,
    memory: Arc<MemoryManager>,
    streaming: Arc<StreamingLayer>,
    config: DispatchConfig,
}

/// Completion signal delivered to dependents.
type Signal = Option<UpstreamOutcome>;

enum RunOutcome {
    Success(Arc<FieldMap>),
    Failed(FailureKind, String),
}

struct UnitRun {
    name: String,
    outcome: RunOutcome,
    duration: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ModuleRegistry>,
        memory: Arc<MemoryManager>,
        streaming: Arc<StreamingLayer>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            streaming,
            config,
        }
    }

    /// The streaming layer shared with units (for stats reporting).
    #[must_use]
    pub fn streaming(&self) -> &Arc<StreamingLayer> {
        &self.streaming
    }

    /// Run all matching units against one file.
    ///
    /// Never fails: unit errors, panics and timeouts are recorded in
    /// `per_unit_status`. A misbehaving unit can shrink the field set but
    /// cannot prevent independent units from completing.
    pub async fn extract(&self, file: FileDescriptor) -> ExtractionResult {
        let mem = self.memory.snapshot();
        let strategy = self.memory.select_strategy(file.size_bytes, &mem);
        if strategy.forces_streaming() {
            // Conservative tuning: give idle pool memory back immediately.
            self.streaming.pool().trim();
        }

        let snapshot = self.registry.snapshot().await;
        let MatchSet { runnable, skipped } = snapshot.find_matching(&file);
        debug!(
            file = %file.path.display(),
            units = runnable.len(),
            skipped = skipped.len(),
            ?strategy,
            pressure = ?mem.pressure,
            registry_version = snapshot.version,
            "dispatching extraction"
        );

        let mut senders: HashMap<String, watch::Sender<Signal>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<Signal>> = HashMap::new();
        for unit in &runnable {
            let (tx, rx) = watch::channel(None);
            senders.insert(unit.name.clone(), tx);
            receivers.insert(unit.name.clone(), rx);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks: JoinSet<UnitRun> = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

        for unit in &runnable {
            let entrypoint = unit
                .entrypoint
                .clone()
                .expect("runnable units always carry an entrypoint");
            let deps: Vec<(String, Option<watch::Receiver<Signal>>)> = unit
                .dependencies
                .iter()
                .map(|d| (d.clone(), receivers.get(d).cloned()))
                .collect();
            let tx = senders
                .remove(&unit.name)
                .expect("one sender per runnable unit");
            let semaphore = Arc::clone(&semaphore);
            let io: Arc<dyn ExtractionIo> = Arc::clone(&self.streaming) as Arc<dyn ExtractionIo>;
            let file = file.clone();
            let name = unit.name.clone();
            let timeout = self.config.unit_timeout;

            let handle = tasks.spawn(run_unit(
                name.clone(),
                entrypoint,
                deps,
                tx,
                semaphore,
                file,
                strategy,
                io,
                timeout,
            ));
            task_names.insert(handle.id(), name);
        }
        drop(receivers);

        let mut runs: HashMap<String, UnitRun> = HashMap::with_capacity(runnable.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, run)) => {
                    runs.insert(run.name.clone(), run);
                }
                Err(join_err) => {
                    // A panicking entrypoint lands here; its sender dropped
                    // unsent, so dependents observe a failed upstream.
                    let name = task_names
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_default();
                    warn!(unit = %name, "unit panicked during extraction");
                    runs.insert(
                        name.clone(),
                        UnitRun {
                            name,
                            outcome: RunOutcome::Failed(
                                FailureKind::Panic,
                                "unit panicked".to_string(),
                            ),
                            duration: Duration::ZERO,
                        },
                    );
                }
            }
        }

        let mut result = ExtractionResult::default();
        for unit in &runnable {
            let Some(run) = runs.get(&unit.name) else {
                continue;
            };
            match &run.outcome {
                RunOutcome::Success(fields) => {
                    for (key, value) in fields.iter() {
                        result.fields.insert(
                            key.clone(),
                            FieldEntry {
                                value: value.clone(),
                                unit: unit.name.clone(),
                            },
                        );
                    }
                    result.per_unit_status.push(UnitReport {
                        unit: unit.name.clone(),
                        outcome: UnitOutcome::Success,
                        kind: None,
                        detail: None,
                        duration: run.duration,
                    });
                }
                RunOutcome::Failed(kind, detail) => {
                    result.per_unit_status.push(UnitReport {
                        unit: unit.name.clone(),
                        outcome: UnitOutcome::Failed,
                        kind: Some(*kind),
                        detail: Some(detail.clone()),
                        duration: run.duration,
                    });
                }
            }
        }
        result.per_unit_status.extend(skipped);
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_unit(
    name: String,
    entrypoint: Arc<dyn metasieve_core::Entrypoint>,
    deps: Vec<(String, Option<watch::Receiver<Signal>>)>,
    tx: watch::Sender<Signal>,
    semaphore: Arc<Semaphore>,
    file: FileDescriptor,
    strategy: Strategy,
    io: Arc<dyn ExtractionIo>,
    timeout: Duration,
) -> UnitRun {
    // Block only on direct dependencies; a worker permit is taken afterwards
    // so waiting units never occupy a worker slot.
    let mut upstream = UpstreamResults::default();
    for (dep, rx) in deps {
        let outcome = match rx {
            Some(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(signal) => signal.clone().expect("signal observed as set"),
                Err(_) => UpstreamOutcome::Failed(format!("dependency {dep} aborted")),
            },
            None => UpstreamOutcome::Failed(format!("dependency {dep} is not loaded")),
        };
        upstream.insert(dep, outcome);
    }

    let permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            let detail = "worker pool closed".to_string();
            let _ = tx.send(Some(UpstreamOutcome::Failed(detail.clone())));
            return UnitRun {
                name,
                outcome: RunOutcome::Failed(FailureKind::Execution, detail),
                duration: Duration::ZERO,
            };
        }
    };

    let ctx = UnitContext {
        file,
        strategy,
        upstream,
        io,
    };
    let start = Instant::now();
    let outcome = match tokio::time::timeout(timeout, entrypoint.run(&ctx)).await {
        Ok(Ok(fields)) => RunOutcome::Success(Arc::new(fields)),
        Ok(Err(err)) => RunOutcome::Failed(failure_kind(&err), err.to_string()),
        Err(_) => RunOutcome::Failed(
            FailureKind::Timeout,
            UnitError::Timeout { limit: timeout }.to_string(),
        ),
    };
    let duration = start.elapsed();
    drop(permit);

    let signal = match &outcome {
        RunOutcome::Success(fields) => UpstreamOutcome::Fields(Arc::clone(fields)),
        RunOutcome::Failed(_, detail) => UpstreamOutcome::Failed(detail.clone()),
    };
    let _ = tx.send(Some(signal));

    UnitRun {
        name,
        outcome,
        duration,
    }
}

fn failure_kind(err: &UnitError) -> FailureKind {
    match err {
        UnitError::Timeout { .. } => FailureKind::Timeout,
        UnitError::UpstreamFailed { .. } => FailureKind::UpstreamFailed,
        UnitError::Execution(_) | UnitError::Io(_) => FailureKind::Execution,
    }
}
