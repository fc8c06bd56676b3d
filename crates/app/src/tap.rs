use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::trace;

const TAP_BUFFER: usize = 128;

/// Pipeline stage a tap event was emitted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingress,
    Interpreter,
    Gift,
    Timer,
    Hub,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Interpreter => "interpreter",
            StageKind::Gift => "gift",
            StageKind::Timer => "timer",
            StageKind::Hub => "hub",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ingress" => Some(StageKind::Ingress),
            "interpreter" => Some(StageKind::Interpreter),
            "gift" => Some(StageKind::Gift),
            "timer" => Some(StageKind::Timer),
            "hub" => Some(StageKind::Hub),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: DateTime<Utc>,
    pub stage: StageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub message: String,
    pub payload: Value,
}

impl StageEvent {
    pub fn new(stage: StageKind, message: impl Into<String>, payload: Value) -> Self {
        Self {
            ts: Utc::now(),
            stage,
            msg_id: None,
            event_type: None,
            message: message.into(),
            payload,
        }
    }

    pub fn with_message_id(mut self, msg_id: &str) -> Self {
        self.msg_id = Some(msg_id.to_string());
        self
    }

    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(&self)?;
        Ok(Event::default().event(self.stage.as_str()).data(data))
    }
}

/// Fan-out of stage events for the `/_debug/tap` stream.
#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl Default for TapHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(TAP_BUFFER);
        Self { sender }
    }

    pub fn publish(&self, event: StageEvent) {
        // No subscribers is the normal case outside of debugging sessions.
        if self.sender.send(event).is_err() {
            trace!(stage = "tap", "tap event dropped without subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let name = item.trim().to_lowercase();
        let stage = StageKind::parse(&name).ok_or_else(|| format!("unknown stage '{name}'"))?;
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}
