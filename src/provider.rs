use axum::http::HeaderMap;
use serde::Serialize;
use std::fmt;

pub const GITHUB_EVENT_HEADER: &str = "X-GitHub-Event";
pub const GITLAB_EVENT_HEADER: &str = "X-Gitlab-Event";

/// Source-control host that delivered the webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
    Bitbucket,
    General,
}

impl Provider {
    /// Classify the sender. Checks run in priority order and the first hit wins.
    pub fn detect(headers: &HeaderMap) -> Self {
        if headers.contains_key(GITHUB_EVENT_HEADER) {
            Provider::GitHub
        } else if headers.contains_key(GITLAB_EVENT_HEADER) {
            Provider::GitLab
        } else if is_bitbucket_client(headers) {
            Provider::Bitbucket
        } else {
            Provider::General
        }
    }

    /// Whether the payload identifies a repository we can scope the build to.
    pub fn is_recognized(self) -> bool {
        !matches!(self, Provider::General)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
            Provider::Bitbucket => "bitbucket",
            Provider::General => "general",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Bitbucket identifies itself through the client user agent (`Bitbucket-Webhooks/2.0`).
fn is_bitbucket_client(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.to_ascii_lowercase().contains("bitbucket"))
        .unwrap_or(false)
}
