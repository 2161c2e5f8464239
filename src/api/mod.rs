//! HTTP handlers and router

pub mod status;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

pub use status::{root, status};
pub use webhook::handle_webhook;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(root).post(handle_webhook))
        .route("/webhook", routing::post(handle_webhook))
        .route("/status", routing::get(status))
        .with_state(state)
}
