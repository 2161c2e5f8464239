use serde::Deserialize;
use std::path::Path;
use tracing::{debug, error};

use crate::error::{Result, WebhookError};

/// The build tool's own list of tracked repositories.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RepositoryCatalog {
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RepositoryEntry {
    pub url: String,
}

impl RepositoryCatalog {
    /// Read the catalog fresh from disk; it may change between builds.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await.map_err(|e| {
            error!("Failed to read repository catalog {:?}: {}", path, e);
            WebhookError::CatalogError(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_slice(&raw).map_err(|e| {
            error!("Failed to parse repository catalog {:?}: {}", path, e);
            e
        })
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| WebhookError::CatalogError(format!("Invalid catalog JSON: {}", e)))
    }

    /// Finds the first repository whose url equals either extracted url.
    pub fn resolve(&self, clone_url: Option<&str>, ssh_url: Option<&str>) -> Option<&str> {
        let found = self
            .repositories
            .iter()
            .find(|repo| Some(repo.url.as_str()) == clone_url || Some(repo.url.as_str()) == ssh_url)
            .map(|repo| repo.url.as_str());
        debug!(
            "Resolved {:?} / {:?} to {:?}",
            clone_url, ssh_url, found
        );
        found
    }
}
