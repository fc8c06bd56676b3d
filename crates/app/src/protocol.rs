use serde::{Deserialize, Serialize};
use subathon_core::TimerSnapshot;

/// Full timer state as rendered by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSync {
    pub remaining_seconds: u64,
    pub running: bool,
}

impl From<TimerSnapshot> for TimerSync {
    fn from(snapshot: TimerSnapshot) -> Self {
        Self {
            remaining_seconds: snapshot.remaining_seconds,
            running: snapshot.running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeChanged {
    pub remaining_seconds: u64,
    pub delta_applied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub remaining_seconds: u64,
    pub running: bool,
}

/// Server to client messages, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Sent on connect and whenever the running flag changes.
    Sync(TimerSync),
    TimeChanged(TimeChanged),
    Tick(Tick),
    Expired,
    /// Reply to a `query` from the same client.
    State(StateReply),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::TimeChanged(_) => "timeChanged",
            Self::Tick(_) => "tick",
            Self::Expired => "expired",
            Self::State(_) => "state",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client to server commands, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientMessage {
    Pause,
    Resume,
    Query {
        #[serde(default)]
        id: Option<String>,
    },
    AddTime {
        amount: i64,
    },
}

impl ClientMessage {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
