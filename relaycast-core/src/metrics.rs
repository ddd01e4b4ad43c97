//! Prometheus metrics collection
//!
//! All metrics live in one crate-level registry and are exposed through the
//! ingress `/metrics` endpoint.

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry, CounterVec,
    Encoder, HistogramVec, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// HTTP request duration histogram
pub static HTTP_REQUEST_DURATION: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
    register_histogram_vec_with_registry!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["endpoint", "method", "status"],
        REGISTRY.clone()
    ).expect("Failed to register HTTP_REQUEST_DURATION")
});

/// HTTP request counter
pub static HTTP_REQUESTS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["endpoint", "method", "status"],
        REGISTRY.clone()
    ).expect("Failed to register HTTP_REQUESTS_TOTAL")
});

/// Database operations
pub mod database {
    use super::{register_counter_vec_with_registry, register_histogram_vec_with_registry, CounterVec, HistogramVec, REGISTRY};

    /// Query duration histogram
    pub static DB_QUERY_DURATION: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
        register_histogram_vec_with_registry!(
            "db_query_duration_seconds",
            "Database query duration in seconds",
            &["operation", "table"],
            REGISTRY.clone()
        ).expect("Failed to register DB_QUERY_DURATION")
    });

    /// Query error counter
    pub static DB_QUERY_ERRORS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "db_query_errors_total",
            "Total number of database query errors",
            &["operation", "table"],
            REGISTRY.clone()
        ).expect("Failed to register DB_QUERY_ERRORS")
    });
}

/// Relay pipeline
pub mod relay {
    use prometheus::{register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge};

    use super::{register_counter_vec_with_registry, CounterVec, REGISTRY};

    /// Submissions by outcome (`accepted`, `rejected`, `failed`)
    pub static SUBMISSIONS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_submissions_total",
            "Total number of submissions by outcome",
            &["outcome"],
            REGISTRY.clone()
        ).expect("Failed to register SUBMISSIONS_TOTAL")
    });

    /// Publish attempts by origin and outcome (`ok`, `failed`, `dropped`)
    pub static PUBLISHES_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_publishes_total",
            "Total number of broker publish attempts",
            &["origin", "outcome"],
            REGISTRY.clone()
        ).expect("Failed to register PUBLISHES_TOTAL")
    });

    /// Persistence failures by origin
    pub static PERSISTENCE_FAILURES_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_persistence_failures_total",
            "Total number of failed store writes",
            &["origin"],
            REGISTRY.clone()
        ).expect("Failed to register PERSISTENCE_FAILURES_TOTAL")
    });

    pub static CLOCK_TICKS_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "relay_clock_ticks_total",
            "Total number of periodic generator ticks",
            REGISTRY.clone()
        ).expect("Failed to register CLOCK_TICKS_TOTAL")
    });

    /// Messages observed by the inbound subscriber, by channel
    pub static INBOUND_MESSAGES_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_inbound_messages_total",
            "Total number of messages observed by the inbound subscriber",
            &["channel"],
            REGISTRY.clone()
        ).expect("Failed to register INBOUND_MESSAGES_TOTAL")
    });

    /// Broker receive failures by loop (`inbound`, `fanout`)
    pub static SUBSCRIPTION_ERRORS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "relay_subscription_errors_total",
            "Total number of broker receive failures",
            &["loop"],
            REGISTRY.clone()
        ).expect("Failed to register SUBSCRIPTION_ERRORS_TOTAL")
    });

    pub static ACTIVE_LISTENERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "relay_active_listeners",
            "Current number of live listener connections",
            REGISTRY.clone()
        ).expect("Failed to register ACTIVE_LISTENERS")
    });

    pub static FORWARDED_MESSAGES_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "relay_forwarded_messages_total",
            "Total number of payloads pushed to listener connections",
            REGISTRY.clone()
        ).expect("Failed to register FORWARDED_MESSAGES_TOTAL")
    });
}

/// Expose metrics in Prometheus format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        HTTP_REQUEST_DURATION.with_label_values(&["/submit", "POST", "200"]).observe(0.1);
        relay::SUBMISSIONS_TOTAL.with_label_values(&["accepted"]).inc();
        relay::PUBLISHES_TOTAL.with_label_values(&["clock_tick", "ok"]).inc();
        relay::CLOCK_TICKS_TOTAL.inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("http_request_duration_seconds"));
        assert!(output.contains("relay_submissions_total"));
        assert!(output.contains("relay_publishes_total"));
        assert!(output.contains("relay_clock_ticks_total"));
    }
}
