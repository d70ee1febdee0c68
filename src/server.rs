//! HTTP status surface.
//!
//! The daemon's outward face: liveness of the daemon itself (`/`), container
//! status history (`/status`), the aggregate pod health bit (`/healthy`) and
//! a self-termination endpoint (`/kill`) used by the scheduler to tear the
//! pod down.

use std::{sync::Arc, time::Duration};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde_json::{Value, json};
use tracing::info;

use crate::{controller::PodController, status::ContainerStatusReport};

const KILL_SIGNAL: i32 = nix::sys::signal::Signal::SIGTERM as i32;

pub fn router(controller: Arc<PodController>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/healthy", get(healthy))
        .route("/kill", get(kill))
        .with_state(controller)
}

async fn root() -> StatusCode {
    StatusCode::OK
}

async fn status(
    State(controller): State<Arc<PodController>>,
) -> Json<Vec<ContainerStatusReport>> {
    Json(controller.status())
}

async fn healthy(State(controller): State<Arc<PodController>>) -> Json<Value> {
    Json(json!({ "healthy": controller.healthy() }))
}

async fn kill(State(controller): State<Arc<PodController>>) -> StatusCode {
    info!("[Server] kill requested; terminating pod");
    let errors = controller.kill(KILL_SIGNAL).await;
    for error in &errors {
        tracing::warn!(message = %error.message, "[Server] kill error");
    }
    // Answer the request first, then take the daemon down.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(1);
    });
    StatusCode::OK
}
