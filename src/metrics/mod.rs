//! Metrics module
//!
//! Process-wide Prometheus counters, registered in the default registry on
//! first use and exposed by the binary's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Requests replayed in transaction order after reconnect.
pub static REPLAYED_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_replayed_requests_total",
        "Requests replayed during import recovery"
    )
    .expect("metric can be registered")
});

/// Requests re-transmitted with their original xid.
pub static RESENT_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_resent_requests_total",
        "Requests resent after a connectivity failure"
    )
    .expect("metric can be registered")
});

/// Per-stripe sub-operation failures seen by lock or start.
pub static SUBIO_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_subio_failures_total",
        "Per-stripe sub-operation failures"
    )
    .expect("metric can be registered")
});

/// Submits that went through the emergency reserve.
pub static DEGRADED_SUBMITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_degraded_submits_total",
        "Page submits served from the emergency reserve"
    )
    .expect("metric can be registered")
});

/// Times a reply allocation had to wait for a pooled buffer.
pub static REPLY_POOL_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_reply_pool_waits_total",
        "Reply allocations that waited for a pooled buffer"
    )
    .expect("metric can be registered")
});

/// Reply allocations that gave up waiting for a pooled buffer.
pub static REPLY_POOL_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stripenet_reply_pool_timeouts_total",
        "Reply allocations that timed out on the pool"
    )
    .expect("metric can be registered")
});

/// Import state transitions, labelled by the state entered.
pub static IMPORT_STATE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stripenet_import_state_transitions_total",
        "Import state transitions by new state",
        &["state"]
    )
    .expect("metric can be registered")
});

/// Force registration so every series shows up before its first event.
pub fn init() {
    Lazy::force(&REPLAYED_REQUESTS);
    Lazy::force(&RESENT_REQUESTS);
    Lazy::force(&SUBIO_FAILURES);
    Lazy::force(&DEGRADED_SUBMITS);
    Lazy::force(&REPLY_POOL_WAITS);
    Lazy::force(&REPLY_POOL_TIMEOUTS);
    Lazy::force(&IMPORT_STATE_TRANSITIONS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_registered() {
        init();
        let before = RESENT_REQUESTS.get();
        RESENT_REQUESTS.inc();
        assert!(RESENT_REQUESTS.get() > before);

        use prometheus::{Encoder, TextEncoder};
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("stripenet_resent_requests_total"));
    }
}
