use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;

pub use crate::telemetry::{
    EntityCountersSnapshot, LifecycleTransitionSnapshot, RuntimeCountersSnapshot,
};

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn entity_snapshot(&self, entity: &str) -> EntityCountersSnapshot {
        self.counters.entity_snapshot(entity)
    }

    pub fn record_reconfiguration(&self, entity: &str) {
        self.counters.record_reconfiguration(entity);
    }

    pub fn record_reload(&self, entity: &str, success: bool) {
        self.counters.record_reload(entity, success);
    }

    pub fn record_deferred_update(&self, entity: &str) {
        self.counters.record_deferred_update(entity);
    }

    pub fn record_unresolved_member(&self, entity: &str) {
        self.counters.record_unresolved_member(entity);
    }

    pub fn record_lifecycle_transition(&self, entity: &str, from: &str, to: &str) {
        self.counters.record_lifecycle_transition(entity, from, to);
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
