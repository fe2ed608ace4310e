//! HTTP edge: shared state, router and the middleware stack.

mod error;
mod health;
mod middleware;

pub use error::{ApiError, ApiErrorBody, ErrorReport, codes, rfc3339};
pub use health::{HealthBody, health};
pub use middleware::{REQUEST_ID_HEADER, RequestContext, log_responses, set_request_context};

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware, response::IntoResponse, routing::get};

use crate::cache::{CacheConfig, CacheService, ResponseCache, response_cache_layer};
use crate::rate_limit::{RateLimiter, rate_limit_layer};

/// Process-scoped state shared by handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheService>,
    pub response_cache: ResponseCache,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        cache: Arc<CacheService>,
        cache_config: CacheConfig,
        rate_limiter: RateLimiter,
    ) -> Self {
        let response_cache = ResponseCache::new(Arc::new(cache_config), Arc::clone(&cache));
        Self {
            cache,
            response_cache,
            rate_limiter,
        }
    }
}

/// Health endpoints behind the full edge stack.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .fallback(not_found)
        .with_state(state.clone());

    apply_edge_layers(router, &state)
}

/// Wrap `router` with the edge middleware. Outermost first: request context,
/// response logging, rate limiting, response cache.
pub fn apply_edge_layers(router: Router, state: &AppState) -> Router {
    let router = if state.response_cache.config.enabled {
        router.layer(axum_middleware::from_fn_with_state(
            state.response_cache.clone(),
            response_cache_layer,
        ))
    } else {
        router
    };

    router
        .layer(axum_middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_layer,
        ))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn not_found(request: axum::extract::Request) -> axum::response::Response {
    ApiError::not_found()
        .with_request_id(RequestContext::request_id_of(&request))
        .with_detail(format!("no route for {}", request.uri().path()))
        .into_response()
}
