//! The HTTP control plane: `/health`, `/input`, `/privacy`, `/scene`,
//! plus the fire-and-forget scene-change notifier. Runs on its own OS
//! thread driving a dedicated single-threaded `tokio` runtime — the one
//! part of this process that is async, because an HTTP listener with
//! short, non-blocking handlers is exactly what axum is for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

use crate::metrics::RelayMetrics;
use crate::output::HEALTHY_WINDOW;
use crate::source::SourceKind;

use super::{ControlState, SceneChangeEvent};

/// Everything an axum handler needs, cloned cheaply per request.
#[derive(Clone)]
pub struct ApiState {
    control: Arc<ControlState>,
    last_output_write: Arc<AtomicU64>,
    metrics: Arc<RelayMetrics>,
    started_at: Instant,
}

impl ApiState {
    /// Wraps the control-plane state, the output writer's last-write
    /// timestamp, and the process-wide metrics counters for axum handlers.
    pub fn new(
        control: Arc<ControlState>,
        last_output_write: Arc<AtomicU64>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            control,
            last_output_write,
            metrics,
            started_at: Instant::now(),
        }
    }

    fn is_healthy(&self) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = self.last_output_write.load(Ordering::Acquire);
        last != 0 && now.saturating_sub(last) < HEALTHY_WINDOW.as_secs()
    }
}

/// Builds the control API's axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/input", get(get_input).post(post_input))
        .route("/privacy", get(get_privacy).post(post_privacy))
        .route("/scene", get(get_scene))
        .with_state(state)
}

async fn get_health(State(state): State<ApiState>) -> Json<Value> {
    let status = if state.is_healthy() { "healthy" } else { "unhealthy" };
    Json(json!({
        "status": status,
        "pipeline_state": "running",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "malformed_packets": state.metrics.malformed_packets(),
        "timestamp_underflows": state.metrics.timestamp_underflows(),
        "splices": state.metrics.splices(),
        "reconnects": state.metrics.reconnects(),
    }))
}

#[derive(Serialize)]
struct InputResponse {
    source: &'static str,
}

fn source_name(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Camera => "camera",
        SourceKind::Drone => "drone",
        SourceKind::Fallback => "fallback",
    }
}

async fn get_input(State(state): State<ApiState>) -> Json<InputResponse> {
    Json(InputResponse {
        source: source_name(state.control.requested_source()),
    })
}

#[derive(Deserialize)]
struct InputRequest {
    source: String,
}

async fn post_input(
    State(state): State<ApiState>,
    body: Result<Json<InputRequest>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    };
    let kind = match body.source.as_str() {
        "camera" => SourceKind::Camera,
        "drone" => SourceKind::Drone,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid source {other:?}") })),
            )
        }
    };
    state.control.set_requested_source(kind);
    (
        StatusCode::OK,
        Json(json!({ "source": source_name(kind) })),
    )
}

#[derive(Serialize)]
struct PrivacyResponse {
    privacy_enabled: bool,
}

async fn get_privacy(State(state): State<ApiState>) -> Json<PrivacyResponse> {
    Json(PrivacyResponse {
        privacy_enabled: state.control.privacy_enabled(),
    })
}

#[derive(Deserialize)]
struct PrivacyRequest {
    enabled: bool,
}

async fn post_privacy(
    State(state): State<ApiState>,
    body: Result<Json<PrivacyRequest>, axum::extract::rejection::JsonRejection>,
) -> (StatusCode, Json<Value>) {
    match body {
        Ok(Json(req)) => {
            state.control.set_privacy_enabled(req.enabled);
            (StatusCode::OK, Json(json!({ "privacy_enabled": req.enabled })))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Serialize)]
struct SceneResponse {
    scene: &'static str,
}

async fn get_scene(State(state): State<ApiState>) -> Json<SceneResponse> {
    Json(SceneResponse {
        scene: state.control.scene(),
    })
}

/// Drains scene-change notifications from the controller thread and
/// fires an at-most-one-in-flight POST to `controller_url` for each,
/// dropping (not queuing) a transition that arrives while a previous
/// notification is still in flight — the controller's published scene
/// is always current, so a dropped notification about a stale scene is
/// harmless, while queuing would only deliver stale-then-fresh in order
/// with added lag.
pub async fn run_notifier(
    mut scene_changes: UnboundedReceiver<SceneChangeEvent>,
    controller_url: Option<Url>,
) {
    let Some(url) = controller_url else {
        // Drain and discard; nothing configured to notify.
        while scene_changes.recv().await.is_some() {}
        return;
    };
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .expect("reqwest client construction");
    let in_flight = Arc::new(AtomicBool::new(false));

    while let Some(event) = scene_changes.recv().await {
        if in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("notifier: dropping scene-change event, previous POST still in flight");
            continue;
        }
        let client = client.clone();
        let url = url.clone();
        let in_flight = Arc::clone(&in_flight);
        tokio::spawn(async move {
            let body = json!({
                "scene": super::scene_name(event.source),
                "privacy_enabled": event.privacy_enabled,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            if let Err(e) = client.post(url).json(&body).send().await {
                log::warn!("notifier: scene-change POST failed: {e}");
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_name_matches_wire_vocabulary() {
        assert_eq!(source_name(SourceKind::Camera), "camera");
        assert_eq!(source_name(SourceKind::Drone), "drone");
        assert_eq!(source_name(SourceKind::Fallback), "fallback");
    }

    #[test]
    fn unhealthy_before_any_write() {
        let state = ApiState::new(
            ControlState::new(),
            Arc::new(AtomicU64::new(0)),
            Arc::new(RelayMetrics::new()),
        );
        assert!(!state.is_healthy());
    }

    #[test]
    fn healthy_within_window() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let state = ApiState::new(
            ControlState::new(),
            Arc::new(AtomicU64::new(now)),
            Arc::new(RelayMetrics::new()),
        );
        assert!(state.is_healthy());
    }
}
