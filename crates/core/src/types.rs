use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const EVENT_CHEER: &str = "channel.cheer";
pub const EVENT_FOLLOW: &str = "channel.follow";
pub const EVENT_SUBSCRIBE: &str = "channel.subscribe";
pub const EVENT_RESUBSCRIBE: &str = "channel.subscription.message";
pub const EVENT_GIFT: &str = "channel.subscription.gift";
pub const EVENT_REWARD: &str = "channel.channel_points_custom_reward_redemption.add";

/// Errors raised when an inbound payload is not structurally a notification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing subscription block in payload")]
    MissingSubscription,
    #[error("subscription.type is required")]
    MissingEventType,
}

/// Subscription tier as reported by EventSub (`"1000"`, `"2000"`, `"3000"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1000" | "1" => Some(Self::Tier1),
            "2000" | "2" => Some(Self::Tier2),
            "3000" | "3" => Some(Self::Tier3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier1 => "1000",
            Self::Tier2 => "2000",
            Self::Tier3 => "3000",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct CheerEvent {
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub bits: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct FollowEvent {
    #[serde(default)]
    pub user_login: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct SubscribeEvent {
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    /// Set when this notification is the receipt side of a gifted subscription.
    #[serde(default)]
    pub is_gift: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GiftEvent {
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    /// Number of subscriptions gifted by this notification.
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RewardEvent {
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub reward: Option<RewardRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewardRef {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Typed view of a notification's `event` block, tagged by subscription type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Cheer(CheerEvent),
    Follow(FollowEvent),
    Subscribe(SubscribeEvent),
    GiftSubscribe(GiftEvent),
    Reward(RewardEvent),
    Unknown { event_type: String },
    /// A known event type whose payload did not have the expected shape.
    Malformed { event_type: String, reason: String },
}

impl NotificationEvent {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Cheer(_) => "cheer",
            Self::Follow(_) => "follow",
            Self::Subscribe(_) => "subscribe",
            Self::GiftSubscribe(_) => "gift_subscribe",
            Self::Reward(_) => "reward",
            Self::Unknown { .. } => "unknown",
            Self::Malformed { .. } => "malformed",
        }
    }

    pub fn actor_login(&self) -> Option<&str> {
        match self {
            Self::Cheer(event) => event.user_login.as_deref(),
            Self::Follow(event) => event.user_login.as_deref(),
            Self::Subscribe(event) => event.user_login.as_deref(),
            Self::GiftSubscribe(event) => event.user_login.as_deref(),
            Self::Reward(event) => event.user_login.as_deref(),
            Self::Unknown { .. } | Self::Malformed { .. } => None,
        }
    }
}

/// One inbound EventSub delivery. Constructed at ingress and consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEnvelope {
    pub message_id: String,
    pub event_type: String,
    pub event: NotificationEvent,
}

impl NotificationEnvelope {
    /// Builds an envelope from the webhook body.
    ///
    /// Only the `subscription.type` field is required. A missing or mistyped
    /// `event` block yields [`NotificationEvent::Malformed`] so the delivery can
    /// still be acknowledged and recorded.
    pub fn from_payload(message_id: &str, payload: &Value) -> Result<Self, EnvelopeError> {
        let subscription = payload
            .get("subscription")
            .ok_or(EnvelopeError::MissingSubscription)?;
        let event_type = subscription
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingEventType)?;

        let event = match payload.get("event") {
            Some(block) if block.is_object() => decode_event(event_type, block),
            _ => match event_type {
                EVENT_CHEER | EVENT_FOLLOW | EVENT_SUBSCRIBE | EVENT_RESUBSCRIBE | EVENT_GIFT
                | EVENT_REWARD => NotificationEvent::Malformed {
                    event_type: event_type.to_string(),
                    reason: "missing event block".to_string(),
                },
                other => NotificationEvent::Unknown {
                    event_type: other.to_string(),
                },
            },
        };

        Ok(Self {
            message_id: message_id.to_string(),
            event_type: event_type.to_string(),
            event,
        })
    }
}

fn decode_event(event_type: &str, block: &Value) -> NotificationEvent {
    let decoded = match event_type {
        EVENT_CHEER => serde_json::from_value(block.clone()).map(NotificationEvent::Cheer),
        EVENT_FOLLOW => serde_json::from_value(block.clone()).map(NotificationEvent::Follow),
        EVENT_SUBSCRIBE | EVENT_RESUBSCRIBE => {
            serde_json::from_value(block.clone()).map(NotificationEvent::Subscribe)
        }
        EVENT_GIFT => serde_json::from_value(block.clone()).map(NotificationEvent::GiftSubscribe),
        EVENT_REWARD => serde_json::from_value(block.clone()).map(NotificationEvent::Reward),
        other => {
            return NotificationEvent::Unknown {
                event_type: other.to_string(),
            }
        }
    };

    decoded.unwrap_or_else(|err| NotificationEvent::Malformed {
        event_type: event_type.to_string(),
        reason: err.to_string(),
    })
}

/// Point-in-time copy of the timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub remaining_seconds: u64,
    pub total_awarded: u64,
    pub running: bool,
    pub max_cap: u64,
    pub starting_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(event_type: &str, event: Value) -> Value {
        json!({
            "subscription": { "type": event_type, "version": "1" },
            "event": event,
        })
    }

    #[test]
    fn decodes_cheer_payload() {
        let payload = body(EVENT_CHEER, json!({ "user_login": "viewer", "bits": 500 }));
        let envelope = NotificationEnvelope::from_payload("msg-1", &payload).expect("envelope");

        assert_eq!(envelope.message_id, "msg-1");
        assert_eq!(
            envelope.event,
            NotificationEvent::Cheer(CheerEvent {
                user_login: Some("viewer".to_string()),
                bits: Some(500),
            })
        );
        assert_eq!(envelope.event.actor_login(), Some("viewer"));
    }

    #[test]
    fn resubscription_message_is_a_subscribe() {
        let payload = body(EVENT_RESUBSCRIBE, json!({ "tier": "2000" }));
        let envelope = NotificationEnvelope::from_payload("msg-2", &payload).expect("envelope");

        assert!(matches!(
            envelope.event,
            NotificationEvent::Subscribe(SubscribeEvent { ref tier, is_gift: false, .. })
                if tier.as_deref() == Some("2000")
        ));
    }

    #[test]
    fn mistyped_field_is_malformed_not_an_error() {
        let payload = body(EVENT_CHEER, json!({ "bits": "lots" }));
        let envelope = NotificationEnvelope::from_payload("msg-3", &payload).expect("envelope");

        assert!(matches!(envelope.event, NotificationEvent::Malformed { .. }));
    }

    #[test]
    fn unsupported_type_is_unknown() {
        let payload = body("stream.online", json!({ "broadcaster_user_id": "b-1" }));
        let envelope = NotificationEnvelope::from_payload("msg-4", &payload).expect("envelope");

        assert_eq!(
            envelope.event,
            NotificationEvent::Unknown {
                event_type: "stream.online".to_string()
            }
        );
    }

    #[test]
    fn missing_subscription_type_is_rejected() {
        let err = NotificationEnvelope::from_payload("msg-5", &json!({ "subscription": {} }))
            .unwrap_err();
        assert_eq!(err, EnvelopeError::MissingEventType);

        let err = NotificationEnvelope::from_payload("msg-6", &json!({})).unwrap_err();
        assert_eq!(err, EnvelopeError::MissingSubscription);
    }

    #[test]
    fn tier_accepts_eventsub_and_short_forms() {
        assert_eq!(Tier::parse("1000"), Some(Tier::Tier1));
        assert_eq!(Tier::parse("3"), Some(Tier::Tier3));
        assert_eq!(Tier::parse("prime"), None);
    }
}
