use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub static TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Tags every event logged while handling the request with a fresh trace id,
/// which is echoed back in `X-Trace-Id`.
pub async fn request_logging(req: Request, next: Next) -> Response {
    let trace_id = Uuid::new_v4().simple().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", %trace_id);

    let started = Instant::now();
    let mut response = next.run(req).instrument(span).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER.clone(), value);
    }

    if status.is_server_error() {
        warn!(%trace_id, %method, %path, status = status.as_u16(), elapsed_ms, "request failed");
    } else {
        info!(%trace_id, %method, %path, status = status.as_u16(), elapsed_ms, "request");
    }
    response
}
