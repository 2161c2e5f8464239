use axum::{Json, extract::State as AxumState, response::IntoResponse};
use serde_json::json;

use crate::SharedState;

pub async fn root() -> &'static str {
    "satis_webhook"
}

/// Returns server uptime and the most recent builds
pub async fn status(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let building = state.build_lock.try_lock().is_err();
    let history = state.history.lock().await;

    Json(json!({
        "server": {
            "name": "satis_webhook",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        },
        "builds": {
            "building": building,
            "current": history.current(),
            "queued_count": history.queued_count(),
            "recent": history.recent(10),
        },
    }))
}
