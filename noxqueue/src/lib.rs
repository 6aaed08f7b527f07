//! noxqueue library crate.
//!
//! A persistent job queue for long-running media tools: jobs are stored in
//! SQLite, claimed by workers through an atomic lease, executed with
//! cooperative cancellation and finalized by a single lifecycle authority.

pub mod config;
pub mod database;
pub mod error;
pub mod executors;
pub mod jobs;
pub mod logging;
pub mod storage;

pub use error::{Error, Result};
