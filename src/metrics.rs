//! Metrics emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the application installs a recorder.

/// Label values
pub mod labels {
    /// Query succeeded
    pub const OUTCOME_SUCCESS: &str = "success";
    /// Query failed
    pub const OUTCOME_ERROR: &str = "error";
    /// Query succeeded but exceeded the slow threshold
    pub const OUTCOME_SLOW: &str = "slow";
    /// No-rows result suppressed by the logger
    pub const OUTCOME_NOT_FOUND: &str = "not_found";
}

/// Counters
pub mod counters {
    /// A handle finished connecting
    pub fn connection_opened(driver: &'static str) {
        metrics::counter!("sqlconn_connections_opened_total", "driver" => driver).increment(1);
    }

    /// A connection attempt failed at `stage`
    pub fn connection_failed(driver: &'static str, stage: &'static str) {
        metrics::counter!(
            "sqlconn_connections_failed_total",
            "driver" => driver,
            "stage" => stage
        )
        .increment(1);
    }

    /// A shared tunnel dialer was created
    pub fn dialer_created(family: &'static str) {
        metrics::counter!("sqlconn_dialers_created_total", "family" => family).increment(1);
    }

    /// A shared tunnel dialer was released
    pub fn dialer_released(family: &'static str) {
        metrics::counter!("sqlconn_dialers_released_total", "family" => family).increment(1);
    }

    /// A traced query completed
    pub fn query_completed(outcome: &'static str) {
        metrics::counter!("sqlconn_queries_total", "outcome" => outcome).increment(1);
    }
}

/// Histograms
pub mod histograms {
    /// Ping round trip, in milliseconds
    pub fn ping_duration(driver: &'static str, duration_ms: u64) {
        metrics::histogram!("sqlconn_ping_duration_ms", "driver" => driver)
            .record(duration_ms as f64);
    }
}
