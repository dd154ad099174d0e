//! Server assembly: configuration, telemetry, and the stdio transport.

pub mod config;
pub mod stdio;
pub mod telemetry;
