//! Webhook authentication and payload extraction

use axum::http::HeaderMap;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::WebhookConfig;
use crate::error::{Result, WebhookError};
use crate::provider::Provider;
use crate::utils::{tokens_match, verify_hub_signature};

pub const GITHUB_SIGNATURE_256_HEADER: &str = "X-Hub-Signature-256";
pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";

const SECRET_MISMATCH: &str = "Hook secret does not match.";
const DEFAULT_GITLAB_HOST: &str = "gitlab.com";

/// Data extracted from an authenticated webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub provider: Provider,
    pub clone_url: Option<String>,
    pub ssh_url: Option<String>,
}

impl WebhookEvent {
    /// An event that carries no repository identity.
    pub fn general() -> Self {
        Self {
            provider: Provider::General,
            clone_url: None,
            ssh_url: None,
        }
    }

    /// Authenticate the delivery against the raw body, then pull the repository
    /// URLs out of the payload. Authentication always runs before any parsing.
    pub fn from_request(
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
        config: &WebhookConfig,
    ) -> Result<Self> {
        let secret = config.secret.as_deref();
        match provider {
            Provider::General => return Ok(Self::general()),
            Provider::GitHub => {
                let signature = header_str(headers, GITHUB_SIGNATURE_256_HEADER)
                    .or_else(|| header_str(headers, GITHUB_SIGNATURE_HEADER));
                let Some(signature) = signature else {
                    error!("GitHub delivery without a signature header");
                    return Err(WebhookError::AuthenticationFailed(SECRET_MISMATCH.into()));
                };
                if !verify_hub_signature(secret, body, signature) {
                    error!("GitHub signature verification failed");
                    return Err(WebhookError::AuthenticationFailed(SECRET_MISMATCH.into()));
                }
            }
            Provider::GitLab => {
                let token = header_str(headers, GITLAB_TOKEN_HEADER);
                if !tokens_match(token, secret) {
                    error!("GitLab token does not match the configured secret");
                    return Err(WebhookError::AuthenticationFailed(SECRET_MISMATCH.into()));
                }
            }
            Provider::Bitbucket => {
                let signature = header_str(headers, GITHUB_SIGNATURE_256_HEADER)
                    .or_else(|| header_str(headers, GITHUB_SIGNATURE_HEADER));
                if let (Some(_), Some(signature)) = (secret, signature) {
                    if !verify_hub_signature(secret, body, signature) {
                        error!("Bitbucket signature verification failed");
                        return Err(WebhookError::AuthenticationFailed(SECRET_MISMATCH.into()));
                    }
                }
            }
        }
        info!("{} delivery authenticated", provider);

        let payload: Value = serde_json::from_slice(body).map_err(|e| {
            info!("Could not parse JSON body: {:?}", e);
            WebhookError::InvalidPayload(e.to_string())
        })?;

        let (clone_url, ssh_url) = match provider {
            Provider::GitHub => (
                string_at(&payload, "/repository/clone_url"),
                string_at(&payload, "/repository/ssh_url"),
            ),
            Provider::GitLab => gitlab_urls(&payload),
            Provider::Bitbucket => bitbucket_urls(&payload),
            Provider::General => (None, None),
        };
        debug!(
            "Extracted clone url {:?}, ssh url {:?}",
            clone_url, ssh_url
        );

        Ok(Self {
            provider,
            clone_url,
            ssh_url,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn string_at(payload: &Value, pointer: &str) -> Option<String> {
    payload
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// GitLab payloads come in several shapes; the first one present wins.
fn gitlab_urls(payload: &Value) -> (Option<String>, Option<String>) {
    let direct = (
        string_at(payload, "/project/http_url"),
        string_at(payload, "/project/ssh_url"),
    );
    if direct.0.is_some() || direct.1.is_some() {
        return direct;
    }

    let repository = (
        string_at(payload, "/repository/git_http_url"),
        string_at(payload, "/repository/git_ssh_url"),
    );
    if repository.0.is_some() || repository.1.is_some() {
        return repository;
    }

    let full_name = string_at(payload, "/project/path_with_namespace")
        .or_else(|| string_at(payload, "/repository/full_name"));
    match full_name {
        Some(name) => {
            let host = string_at(payload, "/project/web_url")
                .or_else(|| string_at(payload, "/repository/homepage"))
                .and_then(|url| host_of(&url))
                .unwrap_or_else(|| DEFAULT_GITLAB_HOST.to_string());
            let name = name.trim_matches('/');
            (
                Some(format!("https://{}/{}.git", host, name)),
                Some(format!("git@{}:{}.git", host, name)),
            )
        }
        None => (None, None),
    }
}

fn bitbucket_urls(payload: &Value) -> (Option<String>, Option<String>) {
    let direct = (
        string_at(payload, "/project/http_url"),
        string_at(payload, "/project/ssh_url"),
    );
    if direct.0.is_some() || direct.1.is_some() {
        return direct;
    }

    let links = payload
        .pointer("/repository/links/clone")
        .and_then(|v| v.as_array());
    let Some(links) = links else {
        return (None, None);
    };
    (clone_link(links, &["https", "http"]), clone_link(links, &["ssh"]))
}

fn clone_link(links: &[Value], names: &[&str]) -> Option<String> {
    links
        .iter()
        .find(|link| {
            link.get("name")
                .and_then(|n| n.as_str())
                .map(|n| names.contains(&n))
                .unwrap_or(false)
        })
        .and_then(|link| link.get("href"))
        .and_then(|h| h.as_str())
        .map(String::from)
}

// `https://gitlab.example.com/group/project` -> `gitlab.example.com`
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
