use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;

/// Exit code reported for every failure that happens before the build tool runs.
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Custom error type for satis_webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(
        "Please, define your satis configuration in a config.yml file.\nYou can use the config.yml.dist as a template."
    )]
    ConfigurationMissing { path: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{}", render_preconditions(.0))]
    PreconditionFailed(Vec<String>),

    #[error("Access denied")]
    AccessDenied,

    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Repository catalog error: {0}")]
    CatalogError(String),

    #[error("Build command could not be started: {0}")]
    BuildSpawnFailed(#[source] io::Error),

    #[error("Build timed out after {0} seconds")]
    BuildTimedOut(u64),

    #[error("Build process could not be awaited: {0}")]
    BuildWaitFailed(#[source] io::Error),
}

fn render_preconditions(errors: &[String]) -> String {
    let mut out = String::from(
        "The build cannot be run due to some errors. Please, review them and check your config.yml:\n",
    );
    for error in errors {
        out.push_str("- ");
        out.push_str(error);
        out.push('\n');
    }
    out
}

impl WebhookError {
    /// Every failure is terminal for the request and maps onto the same sentinel.
    pub fn exit_code(&self) -> i32 {
        FAILURE_EXIT_CODE
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::AccessDenied | WebhookError::AuthenticationFailed(_) => {
                StatusCode::FORBIDDEN
            }
            WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // Nothing beyond the status code leaks for IP rejections.
            WebhookError::AccessDenied => status.into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

/// Helper type for Results that use WebhookError
pub type Result<T> = std::result::Result<T, WebhookError>;
