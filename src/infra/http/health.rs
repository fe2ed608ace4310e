use axum::{Json, extract::State};
use serde::Serialize;
use time::OffsetDateTime;

use super::{AppState, rfc3339};

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// Backend currently serving cache reads: `redis` or `memory`.
    pub cache: &'static str,
    pub timestamp: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        cache: state.cache.mode().as_str(),
        timestamp: rfc3339(OffsetDateTime::now_utc()),
    })
}
