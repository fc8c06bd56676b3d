use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use subathon_core::NotificationEnvelope;
use tracing::{error, info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind};

const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// EventSub webhook ingress. Authenticity is checked upstream of this handler.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let message_type = match parse_message_type(&headers) {
        Ok(message_type) => message_type,
        Err(problem) => {
            histogram!("webhook_ack_latency_seconds", "type" => "unknown")
                .record(start.elapsed().as_secs_f64());
            return Err(problem);
        }
    };

    let message_label = message_type.metric_label();
    let result = handle_message(&state, message_type, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds", "type" => message_label)
        .record(start.elapsed().as_secs_f64());
    result
}

fn parse_message_type(headers: &HeaderMap) -> Result<MessageType, ProblemResponse> {
    let raw = get_required_header(headers, HEADER_MESSAGE_TYPE)?;
    MessageType::try_from(raw)
        .map_err(|detail| ProblemResponse::bad_request("invalid_message_type", detail))
}

async fn handle_message(
    state: &AppState,
    message_type: MessageType,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    let message_id = get_required_header(headers, HEADER_MESSAGE_ID)?;
    let message_label = message_type.metric_label();
    counter!("eventsub_ingress_total", "type" => message_label).increment(1);

    let json_value: Value = serde_json::from_slice(body).map_err(|err| {
        warn!(stage = "ingress", %message_id, error = %err, "webhook body is not valid JSON");
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;
    let event_type = json_value
        .get("subscription")
        .and_then(|sub| sub.get("type"))
        .and_then(Value::as_str)
        .unwrap_or(message_label);

    match message_type {
        MessageType::Verification => {
            let challenge = json_value
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProblemResponse::bad_request(
                        "missing_challenge",
                        "verification payload must include challenge",
                    )
                })?;

            info!(stage = "ingress", %message_id, event_type, "subscription verification answered");
            emit_tap(state, message_id, event_type, message_label, body.len(), None);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge.to_string(),
            )
                .into_response())
        }
        MessageType::Revocation => {
            let status = json_value
                .get("subscription")
                .and_then(|sub| sub.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            warn!(stage = "ingress", %message_id, event_type, status, "subscription revoked");
            emit_tap(state, message_id, event_type, message_label, body.len(), None);
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        MessageType::Notification => {
            let envelope = NotificationEnvelope::from_payload(message_id, &json_value)
                .map_err(|err| ProblemResponse::bad_request("invalid_payload", err.to_string()))?;

            let outcome = state.engine().ingest(envelope).await.map_err(|err| {
                error!(stage = "ingress", %message_id, error = %err, "notification not processed");
                ProblemResponse::engine_unavailable()
            })?;

            info!(
                stage = "ingress",
                %message_id,
                event_type,
                outcome = outcome.as_str(),
                "notification acknowledged"
            );
            emit_tap(
                state,
                message_id,
                event_type,
                message_label,
                body.len(),
                Some(outcome.as_str()),
            );
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

fn emit_tap(
    state: &AppState,
    message_id: &str,
    event_type: &str,
    message_label: &'static str,
    body_len: usize,
    outcome: Option<&'static str>,
) {
    let payload = json!({
        "message_type": message_label,
        "body_len": body_len,
        "outcome": outcome,
    });
    state.tap().publish(
        StageEvent::new(StageKind::Ingress, message_label, payload)
            .with_message_id(message_id)
            .with_event_type(event_type),
    );
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::bad_request("missing_header", format!("missing header {name}"))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl TryFrom<&str> for MessageType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "webhook_callback_verification" => Ok(Self::Verification),
            "notification" => Ok(Self::Notification),
            "revocation" => Ok(Self::Revocation),
            other => Err(format!("unsupported message type: {other}")),
        }
    }
}

impl MessageType {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
    };
    use http_body_util::BodyExt;
    use subathon_util::TimerConfig;
    use tower::ServiceExt;

    use crate::engine::IngressOutcome;
    use crate::router::{app_router, test_state};

    fn timer_config() -> TimerConfig {
        TimerConfig {
            starting_seconds: 100,
            ..TimerConfig::default()
        }
    }

    fn headers(message_type: &str, message_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_MESSAGE_TYPE,
            HeaderValue::from_str(message_type).expect("type header"),
        );
        headers.insert(
            HEADER_MESSAGE_ID,
            HeaderValue::from_str(message_id).expect("id header"),
        );
        headers
    }

    async fn call_webhook(state: AppState, headers: HeaderMap, body: String) -> Response {
        let mut request_headers = headers;
        request_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/eventsub/webhook")
            .body(Body::from(body))
            .expect("request");
        *request.headers_mut() = request_headers;

        app_router(state).oneshot(request).await.expect("response")
    }

    fn cheer_body(bits: u64) -> String {
        json!({
            "subscription": {
                "id": "sub-1",
                "type": "channel.cheer",
                "version": "1",
                "condition": { "broadcaster_user_id": "b-123" }
            },
            "event": {
                "is_anonymous": false,
                "user_id": "user-1",
                "user_login": "viewer_one",
                "broadcaster_user_id": "b-123",
                "message": "Cheer500 go go go",
                "bits": bits
            }
        })
        .to_string()
    }

    async fn remaining(state: &AppState) -> u64 {
        state
            .engine()
            .snapshot()
            .await
            .expect("snapshot")
            .remaining_seconds
    }

    #[tokio::test]
    async fn verification_returns_challenge() {
        let state = test_state(timer_config());
        let body = json!({
            "challenge": "TEST",
            "subscription": { "type": "channel.cheer", "version": "1" }
        })
        .to_string();

        let response = call_webhook(
            state.clone(),
            headers("webhook_callback_verification", "msg-verification"),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain"))
        );
        let body_bytes = response.into_body().collect().await.expect("body");
        assert_eq!(body_bytes.to_bytes(), &b"TEST"[..]);
        assert_eq!(remaining(&state).await, 100);
    }

    #[tokio::test]
    async fn notification_applies_time_and_emits_tap() {
        let state = test_state(timer_config());
        let mut tap_rx = state.tap().subscribe();

        let response =
            call_webhook(state.clone(), headers("notification", "msg-1"), cheer_body(500)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(remaining(&state).await, 125);

        let mut ingress = None;
        while let Ok(event) = tap_rx.try_recv() {
            if event.stage == StageKind::Ingress {
                ingress = Some(event);
            }
        }
        let ingress = ingress.expect("ingress tap event");
        assert_eq!(ingress.msg_id.as_deref(), Some("msg-1"));
        assert_eq!(ingress.event_type.as_deref(), Some("channel.cheer"));
        assert_eq!(ingress.payload["outcome"], "applied");
    }

    #[tokio::test]
    async fn duplicate_notification_is_idempotent() {
        let state = test_state(timer_config());

        for _ in 0..3 {
            let response =
                call_webhook(state.clone(), headers("notification", "msg-dup"), cheer_body(500))
                    .await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        assert_eq!(remaining(&state).await, 125);
    }

    #[tokio::test]
    async fn verification_does_not_consume_the_message_id() {
        let state = test_state(timer_config());
        let verification = json!({
            "challenge": "abc",
            "subscription": { "type": "channel.cheer" }
        })
        .to_string();

        call_webhook(
            state.clone(),
            headers("webhook_callback_verification", "msg-shared"),
            verification,
        )
        .await;
        let response =
            call_webhook(state.clone(), headers("notification", "msg-shared"), cheer_body(20))
                .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(remaining(&state).await, 101);
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_without_time() {
        let state = test_state(timer_config());
        let body = json!({
            "subscription": { "type": "stream.online" },
            "event": { "broadcaster_user_id": "b-123" }
        })
        .to_string();

        let response = call_webhook(state.clone(), headers("notification", "msg-u"), body).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(remaining(&state).await, 100);
    }

    #[tokio::test]
    async fn malformed_event_is_acknowledged_and_marked_processed() {
        let state = test_state(timer_config());
        let mut tap_rx = state.tap().subscribe();
        let body = json!({
            "subscription": { "type": "channel.cheer" },
            "event": { "bits": "lots" }
        });

        let response = call_webhook(
            state.clone(),
            headers("notification", "msg-bad"),
            body.to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(remaining(&state).await, 100);

        let mut ingress = None;
        while let Ok(event) = tap_rx.try_recv() {
            if event.stage == StageKind::Ingress {
                ingress = Some(event);
            }
        }
        let ingress = ingress.expect("ingress tap event");
        assert_eq!(ingress.payload["outcome"], "ignored");

        let response =
            call_webhook(state.clone(), headers("notification", "msg-bad"), cheer_body(500)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(remaining(&state).await, 100);

        let replay = NotificationEnvelope::from_payload("msg-bad", &body).expect("envelope");
        let outcome = state.engine().ingest(replay).await.expect("ingest");
        assert_eq!(outcome, IngressOutcome::Duplicate);
    }

    #[tokio::test]
    async fn revocation_is_acknowledged() {
        let state = test_state(timer_config());
        let body = json!({
            "subscription": { "type": "channel.cheer", "status": "authorization_revoked" }
        })
        .to_string();

        let response = call_webhook(state, headers("revocation", "msg-r"), body).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn rejects_missing_message_id() {
        let state = test_state(timer_config());
        let mut request_headers = HeaderMap::new();
        request_headers.insert(
            HEADER_MESSAGE_TYPE,
            HeaderValue::from_static("notification"),
        );

        let response = call_webhook(state, request_headers, cheer_body(100)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/problem+json"))
        );
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let problem: Value = serde_json::from_slice(&body).expect("problem json");
        assert_eq!(problem["type"], "missing_header");
    }

    #[tokio::test]
    async fn rejects_unknown_message_type() {
        let state = test_state(timer_config());
        let response = call_webhook(state, headers("telemetry", "msg-x"), cheer_body(1)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_invalid_json_and_missing_subscription_type() {
        let state = test_state(timer_config());

        let response = call_webhook(
            state.clone(),
            headers("notification", "msg-bad"),
            "{not json".to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call_webhook(
            state.clone(),
            headers("notification", "msg-no-type"),
            json!({ "subscription": {}, "event": { "bits": 100 } }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(remaining(&state).await, 100);
    }
}
