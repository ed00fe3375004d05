use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Records request count and latency per normalized route.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Replaces path parameters with placeholders to keep label cardinality
/// bounded. Any segment following `sessions`, `blocks` or `interactions`
/// is an identifier, as is anything UUID-shaped.
fn normalize_path(path: &str) -> String {
    let mut normalized = Vec::new();
    let mut previous = "";

    for segment in path.split('/') {
        let placeholder = match previous {
            "sessions" => Some("{id}"),
            "blocks" => Some("{block_id}"),
            "interactions" => Some("{participant_id}"),
            _ if is_uuid_like(segment) => Some("{id}"),
            _ => None,
        };
        match placeholder {
            Some(placeholder) if !segment.is_empty() => normalized.push(placeholder),
            _ => normalized.push(segment),
        }
        previous = segment;
    }

    normalized.join("/")
}

/// UUID format: 8-4-4-4-12 hex characters
fn is_uuid_like(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/v1/live/sessions/550e8400-e29b-41d4-a716-446655440000"),
            "/api/v1/live/sessions/{id}"
        );
        assert_eq!(
            normalize_path("/api/v1/live/sessions/s-1/actions"),
            "/api/v1/live/sessions/{id}/actions"
        );
        assert_eq!(
            normalize_path("/api/v1/live/sessions/s-1/blocks/b-1/interactions/alice"),
            "/api/v1/live/sessions/{id}/blocks/{block_id}/interactions/{participant_id}"
        );
        assert_eq!(normalize_path("/api/v1/live/sessions"), "/api/v1/live/sessions");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_is_uuid_like() {
        assert!(is_uuid_like("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_uuid_like("not-a-uuid"));
        assert!(!is_uuid_like("12345"));
    }
}
