//! Per-service counter of queries that hit a service with no ready endpoints.
//!
//! Values accumulate for the life of the process. Each key is mirrored to the
//! installed `metrics` recorder as `<namespace>_<subsystem>_queries_total`
//! with `namespace` and `service` labels, which is what KEDA's Prometheus
//! scaler queries.

use metrics::{describe_counter, Counter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::service::ServiceRef;

struct Slot {
    count: AtomicU64,
    exported: Counter,
}

/// Shared, monotonic counter keyed by (namespace, service).
///
/// Cloning yields another handle to the same counts.
#[derive(Clone)]
pub struct EmptyEndpointCounter {
    name: Arc<str>,
    slots: Arc<RwLock<HashMap<ServiceRef, Arc<Slot>>>>,
}

impl EmptyEndpointCounter {
    /// Create a counter named `<namespace>_<subsystem>_queries_total`.
    pub fn new(namespace: &str, subsystem: &str) -> Self {
        let name = format!("{namespace}_{subsystem}_queries_total");
        describe_counter!(
            name.clone(),
            "DNS queries to services with no ready endpoints"
        );

        Self {
            name: name.into(),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Exported metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add one to the count for `service`.
    pub fn increment(&self, service: &ServiceRef) {
        let slot = self.slot(service);
        let total = slot.count.fetch_add(1, Ordering::Relaxed) + 1;
        slot.exported.increment(1);
        debug!(namespace = %service.namespace, service = %service.service, total, "empty endpoint query");
    }

    /// Current count for `service` (0 if never incremented).
    pub fn get(&self, service: &ServiceRef) -> u64 {
        self.slots
            .read()
            .get(service)
            .map(|slot| slot.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All non-zero counts, ordered by namespace then service.
    pub fn snapshot(&self) -> Vec<(ServiceRef, u64)> {
        let slots = self.slots.read();
        let mut entries: Vec<(ServiceRef, u64)> = slots
            .iter()
            .map(|(svc, slot)| (svc.clone(), slot.count.load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        entries
    }

    fn slot(&self, service: &ServiceRef) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(service) {
            return slot.clone();
        }

        let mut slots = self.slots.write();
        slots
            .entry(service.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    count: AtomicU64::new(0),
                    exported: metrics::counter!(
                        self.name.to_string(),
                        "namespace" => service.namespace.clone(),
                        "service" => service.service.clone()
                    ),
                })
            })
            .clone()
    }
}

impl std::fmt::Debug for EmptyEndpointCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmptyEndpointCounter")
            .field("name", &self.name)
            .field("keys", &self.slots.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_prefix_parts() {
        let counter = EmptyEndpointCounter::new("coredns", "emptyendpoints");
        assert_eq!(counter.name(), "coredns_emptyendpoints_queries_total");
    }

    #[test]
    fn test_counts_are_per_key() {
        let counter = EmptyEndpointCounter::new("coredns", "emptyendpoints");
        let web = ServiceRef::new("default", "web");
        let api = ServiceRef::new("payments", "api");

        counter.increment(&web);
        counter.increment(&web);
        counter.increment(&api);

        assert_eq!(counter.get(&web), 2);
        assert_eq!(counter.get(&api), 1);
        assert_eq!(counter.get(&ServiceRef::new("default", "api")), 0);
    }

    #[test]
    fn test_clones_share_counts() {
        let counter = EmptyEndpointCounter::new("coredns", "emptyendpoints");
        let other = counter.clone();
        let web = ServiceRef::new("default", "web");

        other.increment(&web);

        assert_eq!(counter.get(&web), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let counter = EmptyEndpointCounter::new("coredns", "emptyendpoints");
        counter.increment(&ServiceRef::new("b", "x"));
        counter.increment(&ServiceRef::new("a", "y"));
        counter.increment(&ServiceRef::new("a", "x"));

        let keys: Vec<String> = counter
            .snapshot()
            .into_iter()
            .map(|(svc, _)| svc.to_string())
            .collect();
        assert_eq!(keys, vec!["a/x", "a/y", "b/x"]);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counter = EmptyEndpointCounter::new("coredns", "emptyendpoints");
        let web = ServiceRef::new("default", "web");
        let threads = 8;
        let per_thread = 1000;

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        counter.increment(&web);
                    }
                });
            }
        });

        assert_eq!(counter.get(&web), threads * per_thread);
    }
}
