//! # metasieve
//!
//! Host library for the metasieve CLI: configuration, the built-in
//! capability units, and assembly of the extraction stack (registry,
//! memory manager, streaming layer, dispatcher).

pub mod config;
pub mod units;

use std::path::PathBuf;
use std::sync::Arc;

use metasieve_dispatch::Dispatcher;
use metasieve_memory::{BufferPool, MemoryManager, StreamingLayer};
use metasieve_registry::ModuleRegistry;

use config::Config;

/// The assembled extraction stack.
pub struct Stack {
    pub registry: Arc<ModuleRegistry>,
    pub memory: Arc<MemoryManager>,
    pub streaming: Arc<StreamingLayer>,
    pub dispatcher: Dispatcher,
}

/// Wire up the full stack over one module directory.
///
/// Registers the built-in entrypoints; the registry is returned unscanned so
/// the caller decides when discovery happens.
pub fn build_stack(modules_dir: PathBuf, config: &Config) -> Stack {
    let mut builder = ModuleRegistry::builder(modules_dir);
    for (id, entrypoint) in units::builtin_entrypoints() {
        builder = builder.with_entrypoint(id, entrypoint);
    }
    let registry = Arc::new(builder.build());

    let memory = Arc::new(MemoryManager::new(config.memory.thresholds()));
    let pool = Arc::new(BufferPool::new(config.memory.max_idle_buffers));
    let streaming = Arc::new(StreamingLayer::new(pool));

    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&memory),
        Arc::clone(&streaming),
        config.dispatch.to_dispatch_config(),
    );

    Stack {
        registry,
        memory,
        streaming,
        dispatcher,
    }
}
