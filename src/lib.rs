#![allow(clippy::result_large_err)]

pub mod app;
pub mod cluster;
pub mod config;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod telemetry;

pub use error::{Error, Result};
