//! Library crate for ci-scan-rs: readiness probing and sequential scan-step execution.
pub mod config;
pub mod error;
pub mod probe;
pub mod runner;
pub mod runtime;
pub mod steps;
pub mod target;
pub mod types;
