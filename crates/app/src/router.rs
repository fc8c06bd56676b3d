use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use subathon_core::TimerSnapshot;
use tracing::warn;

use crate::engine::EngineHandle;
use crate::problem::ProblemResponse;
use crate::sse::{self, SseStream};
use crate::tap::{parse_stage_list, tap_keep_alive, tap_stream, TapFilter, TapHub};
use crate::{telemetry, webhook, ws};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    engine: EngineHandle,
    sse_heartbeat_secs: u64,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        engine: EngineHandle,
        sse_heartbeat_secs: u64,
    ) -> Self {
        Self {
            metrics,
            tap,
            engine,
            sse_heartbeat_secs,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn sse_heartbeat(&self) -> u64 {
        self.sse_heartbeat_secs
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/tap", get(debug_tap))
        .route("/eventsub/webhook", post(webhook::handle))
        .route("/ws", get(ws::ws_handler))
        .route("/timer/sse", get(timer_sse))
        .route("/timer/state", get(timer_state))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    ProblemResponse,
> {
    let stages = parse_stage_list(query.s)
        .map_err(|err| ProblemResponse::bad_request("invalid_query", err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter);

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}

async fn timer_sse(State(state): State<AppState>) -> Result<Sse<SseStream>, ProblemResponse> {
    let stream = SseStream::subscribe(state.engine()).await.map_err(|err| {
        warn!(stage = "sse", error = %err, "overlay stream rejected");
        ProblemResponse::engine_unavailable()
    })?;
    Ok(Sse::new(stream).keep_alive(sse::keep_alive(state.sse_heartbeat())))
}

async fn timer_state(
    State(state): State<AppState>,
) -> Result<Json<TimerSnapshot>, ProblemResponse> {
    let snapshot = state.engine().snapshot().await.map_err(|err| {
        warn!(stage = "app", error = %err, "timer state unavailable");
        ProblemResponse::engine_unavailable()
    })?;
    Ok(Json(snapshot))
}

#[cfg(test)]
pub(crate) fn test_state(timer: subathon_util::TimerConfig) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let tap = TapHub::new();
    let (engine, _task) = crate::engine::Engine::new(&timer, tap.clone()).spawn();
    AppState::new(metrics, tap, engine, 25)
}
