//! Runtime adapters: HTTP surface, telemetry and bootstrap errors.

pub mod error;
pub mod http;
pub mod telemetry;
