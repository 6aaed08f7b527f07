//! Process configuration loaded from environment variables.
//!
//! `.env` files are honored through `dotenvy`. Every variable is optional;
//! values that are present but malformed are rejected rather than silently
//! replaced by defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use strum::IntoEnumIterator;

use crate::database::models::JobTool;
use crate::jobs::WorkerConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:noxqueue.db?mode=rwc";

/// Prefix for per-tool command templates, e.g. `NOXQUEUE_COMMAND_TRANSCODE`.
pub const COMMAND_VAR_PREFIX: &str = "NOXQUEUE_COMMAND_";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub storage_dir: PathBuf,
    pub log_dir: PathBuf,
    pub worker: WorkerConfig,
    /// Command templates for the generic executor, keyed by tool.
    pub commands: HashMap<JobTool, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            storage_dir: PathBuf::from("./data/files"),
            log_dir: PathBuf::from("./logs"),
            worker: WorkerConfig::default(),
            commands: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` (default: `sqlite:noxqueue.db?mode=rwc`)
    /// - `NOXQUEUE_STORAGE_DIR` (default: `./data/files`)
    /// - `NOXQUEUE_WORK_DIR` (default: `./data/work`)
    /// - `NOXQUEUE_LOG_DIR` (default: `./logs`)
    /// - `NOXQUEUE_WORKER_ID` (default: `worker-<pid>-<random>`)
    /// - `NOXQUEUE_POLL_INTERVAL_MS` (default: 2000)
    /// - `NOXQUEUE_STALE_LOCK_SECS` (default: 300)
    /// - `NOXQUEUE_WATCH_INTERVAL_MS` (default: 500)
    /// - `NOXQUEUE_SHUTDOWN_TIMEOUT_MS` (default: 2000)
    /// - `NOXQUEUE_RECOVER_ON_START` (default: true)
    /// - `NOXQUEUE_COMMAND_<TOOL>`: command template per tool
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = var("NOXQUEUE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("NOXQUEUE_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        let worker = &mut config.worker;
        if let Some(dir) = var("NOXQUEUE_WORK_DIR") {
            worker.work_dir = PathBuf::from(dir);
        }
        if let Some(id) = var("NOXQUEUE_WORKER_ID") {
            worker.worker_id = id.trim().to_string();
        }
        if let Some(v) = var("NOXQUEUE_POLL_INTERVAL_MS") {
            worker.poll_interval_ms = parse_positive("NOXQUEUE_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("NOXQUEUE_STALE_LOCK_SECS") {
            worker.stale_lock_secs = parse_positive("NOXQUEUE_STALE_LOCK_SECS", &v)?;
        }
        if let Some(v) = var("NOXQUEUE_WATCH_INTERVAL_MS") {
            worker.watch_interval_ms = parse_positive("NOXQUEUE_WATCH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("NOXQUEUE_SHUTDOWN_TIMEOUT_MS") {
            worker.shutdown_timeout_ms = parse::<u64>("NOXQUEUE_SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("NOXQUEUE_RECOVER_ON_START") {
            worker.recover_on_start = parse_bool("NOXQUEUE_RECOVER_ON_START", &v)?;
        }

        for tool in JobTool::iter() {
            let key = format!("{COMMAND_VAR_PREFIX}{}", tool.as_str().to_ascii_uppercase());
            if let Some(template) = var(&key) {
                config.commands.insert(tool, template);
            }
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}: invalid value '{value}': {e}")))
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match parse::<u64>(key, value)? {
        0 => Err(Error::config(format!("{key}: must be greater than zero"))),
        n => Ok(n),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key}: invalid boolean '{value}'"))),
    }
}
