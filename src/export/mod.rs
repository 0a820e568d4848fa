//! Operational surfaces: prometheus metrics and liveness probes.

pub mod health;

pub use health::HealthMetrics;
