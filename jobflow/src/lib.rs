//! jobflow: a two-stage job scheduling engine.
//!
//! Jobs are validated by a setup queue and, on success, run by an execution
//! queue. Both stages have bounded concurrency, FIFO dispatch, cooperative
//! cancellation and pause/resume. Results, steps, produced files and counters
//! are recorded in SQLite.

pub mod config;
pub mod database;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod service;
pub mod utils;
pub mod workflow;

pub use error::{Error, Result};
