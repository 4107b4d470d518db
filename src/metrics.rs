//! Metrics instrumentation for emptyendpoints-dns.
//!
//! Operational metrics are prefixed with `emptyendpoints_dns.`. The counter
//! that autoscalers consume lives in [`crate::counter`] and keeps its own
//! fixed name.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(
        "emptyendpoints_dns.query.count",
        "DNS queries seen by the detection pipeline, by outcome"
    );
    describe_counter!(
        "emptyendpoints_dns.lookup.count",
        "Endpoint cache lookups, by result"
    );
    describe_histogram!(
        "emptyendpoints_dns.lookup.duration.seconds",
        "Endpoint cache lookup latency"
    );
    describe_counter!(
        "emptyendpoints_dns.watch.event.count",
        "Endpoints watch events, by kind"
    );
    describe_counter!(
        "emptyendpoints_dns.watch.restart.count",
        "Endpoints watch restarts, by reason"
    );
    describe_counter!(
        "emptyendpoints_dns.forward.count",
        "Queries relayed upstream, by result"
    );
    describe_histogram!(
        "emptyendpoints_dns.forward.duration.seconds",
        "Upstream round-trip latency"
    );
    describe_gauge!(
        "emptyendpoints_dns.cache.objects",
        "Endpoints objects held in the cache"
    );
    describe_gauge!(
        "emptyendpoints_dns.cache.ready",
        "1 once the endpoint cache finished its initial list"
    );
}

/// Where a query left the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Name is not a cluster-local service name.
    NotService,
    /// Namespace is not in the allow-list.
    Filtered,
    /// Query was handed to the oracle.
    Watched,
}

/// Record where a query left the pipeline.
pub fn record_query(outcome: QueryOutcome) {
    let outcome_str = match outcome {
        QueryOutcome::NotService => "not_service",
        QueryOutcome::Filtered => "filtered",
        QueryOutcome::Watched => "watched",
    };

    counter!("emptyendpoints_dns.query.count", "outcome" => outcome_str).increment(1);
}

/// Result of an endpoint cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// Object found with at least one ready address.
    Ready,
    /// Object found with no ready addresses.
    Empty,
    /// No object for the service.
    NotFound,
    /// No cache configured.
    Unavailable,
    /// Lookup exceeded its timeout.
    Timeout,
    /// Lookup failed.
    Error,
}

/// Record an endpoint cache lookup.
pub fn record_lookup(result: LookupResult, duration: std::time::Duration) {
    let result_str = match result {
        LookupResult::Ready => "ready",
        LookupResult::Empty => "empty",
        LookupResult::NotFound => "not_found",
        LookupResult::Unavailable => "unavailable",
        LookupResult::Timeout => "timeout",
        LookupResult::Error => "error",
    };

    counter!("emptyendpoints_dns.lookup.count", "result" => result_str).increment(1);
    histogram!("emptyendpoints_dns.lookup.duration.seconds").record(duration.as_secs_f64());
}

/// Endpoints watch event kinds.
#[derive(Debug, Clone, Copy)]
pub enum WatchEventType {
    /// Object added or modified.
    Apply,
    /// Object deleted.
    Delete,
    /// Initial list started.
    Init,
    /// Object delivered by the initial list.
    InitApply,
    /// Initial list complete.
    InitDone,
    /// Watch stream error (the watcher retries with backoff).
    Error,
}

/// Record an Endpoints watch event.
pub fn record_watch_event(event_type: WatchEventType) {
    let event_str = match event_type {
        WatchEventType::Apply => "apply",
        WatchEventType::Delete => "delete",
        WatchEventType::Init => "init",
        WatchEventType::InitApply => "init_apply",
        WatchEventType::InitDone => "init_done",
        WatchEventType::Error => "error",
    };

    counter!("emptyendpoints_dns.watch.event.count", "event" => event_str).increment(1);
}

/// Watch restart reasons.
#[derive(Debug, Clone, Copy)]
pub enum RestartReason {
    /// First start of the watch.
    InitialConnect,
    /// Watch failed and is retried after a backoff.
    Backoff,
}

/// Record an Endpoints watch (re)start.
pub fn record_watch_restart(reason: RestartReason) {
    let reason_str = match reason {
        RestartReason::InitialConnect => "initial_connect",
        RestartReason::Backoff => "backoff",
    };

    counter!("emptyendpoints_dns.watch.restart.count", "reason" => reason_str).increment(1);
}

/// Result of relaying a query upstream.
#[derive(Debug, Clone, Copy)]
pub enum ForwardResult {
    /// Answer relayed over UDP.
    Udp,
    /// Answer relayed over TCP after a truncated UDP answer.
    Tcp,
    /// Upstream did not answer in time.
    Timeout,
    /// Any other upstream failure.
    Error,
}

/// Record an upstream round trip.
pub fn record_forward(result: ForwardResult, duration: std::time::Duration) {
    let result_str = match result {
        ForwardResult::Udp => "udp",
        ForwardResult::Tcp => "tcp",
        ForwardResult::Timeout => "timeout",
        ForwardResult::Error => "error",
    };

    counter!("emptyendpoints_dns.forward.count", "result" => result_str).increment(1);
    histogram!("emptyendpoints_dns.forward.duration.seconds").record(duration.as_secs_f64());
}

/// Record endpoint cache size and readiness.
pub fn record_cache_state(objects: usize, ready: bool) {
    gauge!("emptyendpoints_dns.cache.objects").set(objects as f64);
    gauge!("emptyendpoints_dns.cache.ready").set(if ready { 1.0 } else { 0.0 });
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
