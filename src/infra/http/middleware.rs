use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::ErrorReport;
use crate::cache::CACHE_STATUS_HEADER;

const LOG_TARGET: &str = "voxgate::http::response";

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    pub fn request_id_of<B>(request: &Request<B>) -> Option<String> {
        request
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.request_id.clone())
    }
}

/// Tag the request with a fresh id and echo it back as `x-request-id`.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log every 4xx/5xx with whatever `ErrorReport` the handler attached.
///
/// 429s are expected under load and the limiter already records them, so
/// they stay at debug level.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = Instant::now();
    let request_id = RequestContext::request_id_of(&request).unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let cache = response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_owned();
    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("handler", Vec::new()),
    };
    let detail = messages.first().map(String::as_str).unwrap_or("");

    if status.is_server_error() {
        error!(
            target: LOG_TARGET,
            status = status.as_u16(),
            %method,
            %path,
            elapsed_ms,
            cache = %cache,
            source,
            detail,
            chain = ?messages,
            request_id = %request_id,
            "request failed"
        );
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        debug!(
            target: LOG_TARGET,
            %method,
            %path,
            request_id = %request_id,
            "request throttled"
        );
    } else {
        warn!(
            target: LOG_TARGET,
            status = status.as_u16(),
            %method,
            %path,
            elapsed_ms,
            source,
            detail,
            request_id = %request_id,
            "client request error"
        );
    }

    response
}
