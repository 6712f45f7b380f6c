//! Runtime glue: configuration and telemetry.

pub mod config;
pub mod telemetry;
