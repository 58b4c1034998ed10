//! Local operator API: the control surface a human (or test harness) uses to
//! inject simulated events and observe the device configuration.
//!
//! Events are forwarded to the session over a channel and handled there; this
//! layer never touches session state directly.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::fota::FotaRequest;
use crate::session::OperatorEvent;
use crate::twin::LocalConfig;

#[derive(Clone)]
pub struct ApiState {
    events: mpsc::UnboundedSender<OperatorEvent>,
    config: watch::Receiver<LocalConfig>,
}

impl ApiState {
    pub fn new(
        events: mpsc::UnboundedSender<OperatorEvent>,
        config: watch::Receiver<LocalConfig>,
    ) -> Self {
        Self { events, config }
    }
}

pub async fn start(address: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(address).await?;
    info!("operator API listening on {address}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/config", get(get_config).post(set_config))
        .route("/v1/message", post(send_message))
        .route("/v1/batch", post(send_batch))
        .route("/v1/fota", post(trigger_fota))
        .route("/v1/report", post(report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_config(State(state): State<ApiState>) -> Json<Value> {
    Json(Value::Object(state.config.borrow().clone()))
}

async fn set_config(
    State(state): State<ApiState>,
    Json(update): Json<Map<String, Value>>,
) -> StatusCode {
    dispatch(&state, OperatorEvent::SetConfig(update))
}

async fn send_message(State(state): State<ApiState>, Json(message): Json<Value>) -> StatusCode {
    dispatch(&state, OperatorEvent::SendMessage(message))
}

async fn send_batch(State(state): State<ApiState>, Json(batch): Json<Value>) -> StatusCode {
    dispatch(&state, OperatorEvent::SendBatch(batch))
}

async fn trigger_fota(
    State(state): State<ApiState>,
    Json(request): Json<FotaRequest>,
) -> StatusCode {
    dispatch(&state, OperatorEvent::TriggerFota(request))
}

async fn report(State(state): State<ApiState>, Json(patch): Json<Value>) -> StatusCode {
    dispatch(&state, OperatorEvent::Report(patch))
}

fn dispatch(state: &ApiState, event: OperatorEvent) -> StatusCode {
    match state.events.send(event) {
        Ok(()) => StatusCode::ACCEPTED,
        // the session is gone, nothing left to deliver to
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
