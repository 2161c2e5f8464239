pub mod access;
pub mod api;
pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;
pub mod provider;
pub mod utils;
pub mod webhook;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use job::BuildHistory;

pub const MAX_BUILD_HISTORY: usize = 24;

pub struct AppState {
    /// Re-read on every delivery so edits apply without a restart.
    pub config_path: PathBuf,
    /// Held for the whole build; deliveries that arrive meanwhile wait their turn.
    pub build_lock: Mutex<()>,
    pub history: Mutex<BuildHistory>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            build_lock: Mutex::new(()),
            history: Mutex::new(BuildHistory::new(MAX_BUILD_HISTORY)),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
