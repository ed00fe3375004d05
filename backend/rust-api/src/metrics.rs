use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Database Metrics (MongoDB)
    pub static ref DB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "db_operations_total",
        "Total number of database operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref DB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "db_operation_duration_seconds",
        "Database operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Remote session store (Redis)
    pub static ref REMOTE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "remote_operations_total",
        "Total number of remote session store operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref REMOTE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "remote_operation_duration_seconds",
        "Remote session store operation duration in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]
    )
    .unwrap();

    // Play-state orchestration
    pub static ref PHASE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "phase_transitions_total",
        "Play phase transitions applied optimistically",
        &["from", "to", "trigger"]
    )
    .unwrap();

    pub static ref TRANSITIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "transitions_rejected_total",
        "Host actions rejected by the play machine",
        &["action"]
    )
    .unwrap();

    pub static ref COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "commands_total",
        "Commands sent to the remote store",
        &["command", "status"]
    )
    .unwrap();

    pub static ref ROLLBACKS_TOTAL: IntCounter = register_int_counter!(
        "optimistic_rollbacks_total",
        "Optimistic updates discarded after a rejected command"
    )
    .unwrap();

    pub static ref FEED_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "feed_events_total",
        "Change feed events received",
        &["table", "outcome"]
    )
    .unwrap();

    pub static ref FEEDS_CONNECTED: IntGauge = register_int_gauge!(
        "feeds_connected",
        "Sessions whose change feed is currently connected"
    )
    .unwrap();

    pub static ref RESYNCS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "resyncs_total",
        "Authoritative snapshot refetches",
        &["status"]
    )
    .unwrap();

    pub static ref SESSIONS_ATTACHED: IntGauge = register_int_gauge!(
        "sessions_attached",
        "Sessions with a running orchestrator"
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();

    // Interaction Metrics
    pub static ref ANSWER_CHECKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answer_checks_total",
        "Answers checked by interaction machines",
        &["plugin", "correct"]
    )
    .unwrap();

    pub static ref PROGRESS_REPORTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "progress_reports_total",
        "Interaction reports received by session progression",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track database operation with metrics
pub async fn track_db_operation<F, T>(
    operation: &str,
    collection: &str,
    future: F,
) -> Result<T, anyhow::Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    DB_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    DB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

/// Helper: track remote store operation with metrics
pub async fn track_remote_operation<F, T, E>(operation: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    REMOTE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    REMOTE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

/// Record a command outcome
pub fn record_command(command: &str, status: &str) {
    COMMANDS_TOTAL.with_label_values(&[command, status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
        let _ = PHASE_TRANSITIONS_TOTAL
            .with_label_values(&["lobby", "countdown", "host"])
            .get();
    }

    #[test]
    fn test_render_metrics() {
        record_command("update_play_state", "confirmed");

        let output = render_metrics().unwrap();
        assert!(output.contains("commands_total"));
    }

    #[tokio::test]
    async fn test_track_remote_operation_counts_errors() {
        let before = REMOTE_OPERATIONS_TOTAL
            .with_label_values(&["ping", "error"])
            .get();
        let result: Result<(), String> =
            track_remote_operation("ping", async { Err("down".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(
            REMOTE_OPERATIONS_TOTAL
                .with_label_values(&["ping", "error"])
                .get(),
            before + 1
        );
    }
}
