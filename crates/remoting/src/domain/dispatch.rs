//! Dispatch table: request code -> (processor, executor, rejection policy).
//!
//! Lookups hand out an `Arc` to the entry, so replacing a code's entry never
//! affects dispatches that already resolved the old one.

use crate::adapters::executor::WorkerPool;
use crate::ports::inbound::RequestProcessor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Predicate deciding whether an entry refuses new work right now.
pub type RejectionPolicy = Arc<dyn Fn(&dyn RequestProcessor, &WorkerPool) -> bool + Send + Sync>;

/// Rejects when the processor asks to, or when its executor queue is full.
pub fn default_rejection_policy() -> RejectionPolicy {
    Arc::new(|processor: &dyn RequestProcessor, executor: &WorkerPool| {
        processor.reject_request() || executor.is_saturated()
    })
}

/// One registered handler
pub struct DispatchEntry {
    processor: Arc<dyn RequestProcessor>,
    executor: Option<Arc<WorkerPool>>,
    policy: RejectionPolicy,
}

impl DispatchEntry {
    pub fn new(
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
        policy: RejectionPolicy,
    ) -> Self {
        Self {
            processor,
            executor,
            policy,
        }
    }

    pub fn processor(&self) -> &Arc<dyn RequestProcessor> {
        &self.processor
    }

    /// Dedicated executor, if any; `None` means the shared public executor.
    pub fn executor(&self) -> Option<&Arc<WorkerPool>> {
        self.executor.as_ref()
    }

    /// Evaluate the rejection policy against the executor work would run on.
    pub fn should_reject(&self, executor: &WorkerPool) -> bool {
        (self.policy)(self.processor.as_ref(), executor)
    }
}

/// Code-keyed processor registry with an optional fallback.
pub struct DispatchTable {
    entries: RwLock<HashMap<i32, Arc<DispatchEntry>>>,
    default_entry: RwLock<Option<Arc<DispatchEntry>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_entry: RwLock::new(None),
        }
    }

    /// Register `entry` for `code`, returning the entry it replaced.
    pub fn register(&self, code: i32, entry: DispatchEntry) -> Option<Arc<DispatchEntry>> {
        let previous = self.entries.write().insert(code, Arc::new(entry));
        if previous.is_some() {
            info!(code = code, "Replaced request processor");
        } else {
            debug!(code = code, "Registered request processor");
        }
        previous
    }

    /// Handler for codes with no explicit entry
    pub fn register_default(&self, entry: DispatchEntry) -> Option<Arc<DispatchEntry>> {
        self.default_entry.write().replace(Arc::new(entry))
    }

    /// Entry for `code`, falling back to the default processor.
    pub fn lookup(&self, code: i32) -> Option<Arc<DispatchEntry>> {
        if let Some(entry) = self.entries.read().get(&code) {
            return Some(Arc::clone(entry));
        }
        self.default_entry.read().clone()
    }

    pub fn contains(&self, code: i32) -> bool {
        self.entries.read().contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}
