//! Optional metrics instrumentation for waypoint.
//!
//! When the `observe` feature is enabled, consumer operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record a ledger commit (counter + latency histogram).
///
/// - `waypoint.ledger.commits_total` – counter with `outcome` label
/// - `waypoint.ledger.commit_duration_seconds` – histogram
#[inline]
pub fn record_commit(name: &str, duration: std::time::Duration, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("waypoint.ledger.commits_total", "checkpoint" => name.to_string(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("waypoint.ledger.commit_duration_seconds", "checkpoint" => name.to_string())
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (name, duration, success);
    }
}

/// Record one handler invocation.
///
/// - `waypoint.handler.invocations_total` – counter with `outcome` label
/// - `waypoint.handler.duration_seconds` – histogram
#[inline]
pub fn record_handler(name: &str, duration: std::time::Duration, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("waypoint.handler.invocations_total", "checkpoint" => name.to_string(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("waypoint.handler.duration_seconds", "checkpoint" => name.to_string())
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (name, duration, success);
    }
}

/// Record a message parked in the dead-letter sink.
///
/// - `waypoint.dead_letters_total` – counter
#[inline]
pub fn record_dead_letter(name: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("waypoint.dead_letters_total", "checkpoint" => name.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = name;
    }
}

/// Set the last committed position gauge.
///
/// - `waypoint.checkpoint.position` – gauge
#[inline]
pub fn set_checkpoint(name: &str, position: u64) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("waypoint.checkpoint.position", "checkpoint" => name.to_string())
            .set(position as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (name, position);
    }
}

/// Record a subscription reconnect after a transient failure.
///
/// - `waypoint.subscription.reconnects_total` – counter
#[inline]
pub fn record_reconnect() {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("waypoint.subscription.reconnects_total").increment(1);
    }
}

/// Record the catch-up transition.
///
/// - `waypoint.subscription.caught_up_total` – counter
#[inline]
pub fn record_caught_up(name: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("waypoint.subscription.caught_up_total", "checkpoint" => name.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = name;
    }
}
