//! Edge layer for the voice-agent API: per-route fixed-window rate limiting
//! and an ETag-aware response cache backed by Redis with an in-process
//! fallback.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod rate_limit;
pub mod util;
