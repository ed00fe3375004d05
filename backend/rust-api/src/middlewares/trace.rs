use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Clone, Debug)]
pub struct RequestTraceContext {
    pub trace_id: String,
}

/// Propagates the caller's `x-trace-id` (or a fresh one) into request
/// extensions and echoes it on the response so host console logs can be
/// matched with orchestrator logs.
pub async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    tracing::debug!(
        "{} {} trace_id={}",
        request.method(),
        request.uri().path(),
        trace_id
    );

    request.extensions_mut().insert(RequestTraceContext {
        trace_id: trace_id.clone(),
    });
    set_if_missing(request.headers_mut(), &trace_id);

    let mut response = next.run(request).await;
    set_if_missing(response.headers_mut(), &trace_id);
    response
}

fn set_if_missing(headers: &mut HeaderMap, trace_id: &str) {
    if headers.contains_key(TRACE_ID_HEADER) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }
}
