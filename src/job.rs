use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::provider::Provider;

/// Represents the status of a rebuild
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// One webhook-triggered rebuild, kept in memory for `/status`
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub id: String,
    pub provider: Provider,
    /// `None` for a full rebuild.
    pub repository_url: Option<String>,
    pub status: BuildStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl BuildRecord {
    /// Create a new build in Queued status
    pub fn new(provider: Provider, repository_url: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            provider,
            repository_url,
            status: BuildStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = BuildStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_finished(&mut self, exit_code: i32) {
        self.status = if exit_code == 0 {
            BuildStatus::Success
        } else {
            BuildStatus::Failed
        };
        self.completed_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = BuildStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }
}

/// Bounded, newest-last history of builds
pub struct BuildHistory {
    builds: VecDeque<BuildRecord>,
    max_builds: usize,
}

impl BuildHistory {
    pub fn new(max_builds: usize) -> Self {
        Self {
            builds: VecDeque::with_capacity(max_builds),
            max_builds,
        }
    }

    pub fn add(&mut self, build: BuildRecord) {
        if self.max_builds == 0 {
            return;
        }
        while self.builds.len() >= self.max_builds {
            self.builds.pop_front();
        }
        self.builds.push_back(build);
    }

    pub fn update<F>(&mut self, id: &str, f: F)
    where
        F: FnOnce(&mut BuildRecord),
    {
        if let Some(build) = self.builds.iter_mut().find(|b| b.id == id) {
            f(build);
        }
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&BuildRecord> {
        self.builds.iter().find(|b| b.id == id)
    }

    pub fn current(&self) -> Option<&BuildRecord> {
        self.builds
            .iter()
            .rev()
            .find(|b| b.status == BuildStatus::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.builds
            .iter()
            .filter(|b| b.status == BuildStatus::Queued)
            .count()
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<BuildRecord> {
        self.builds.iter().rev().take(limit).cloned().collect()
    }
}
