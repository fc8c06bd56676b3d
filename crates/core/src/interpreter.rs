use serde_json::{json, Value};

use crate::rates::RateTable;
use crate::types::{NotificationEnvelope, NotificationEvent, Tier};

/// Seconds proposed for addition to the countdown.
pub type TimeDelta = u64;

/// Result of interpreting one notification against the rate table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// Time to apply directly to the accumulator.
    Delta(TimeDelta),
    /// Gifted subscriptions that must go through the aggregation window.
    Gift { tier: Tier, count: u64 },
    /// Nothing to apply. The delivery is still acknowledged and recorded.
    Ignored(IgnoreReason),
}

impl Interpretation {
    /// Direct delta, if any. Gifts and ignored events yield `None`.
    pub fn delta(&self) -> Option<TimeDelta> {
        match self {
            Self::Delta(seconds) => Some(*seconds),
            _ => None,
        }
    }

    pub fn redacted(&self) -> Value {
        match self {
            Self::Delta(seconds) => json!({ "action": "delta", "seconds": seconds }),
            Self::Gift { tier, count } => {
                json!({ "action": "gift", "tier": tier.as_str(), "count": count })
            }
            Self::Ignored(reason) => json!({ "action": "ignored", "reason": reason.as_str() }),
        }
    }
}

/// Why a notification produced no time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownEventType,
    MalformedPayload,
    MissingField,
    UnknownTier,
    UnknownReward,
    GiftReceipt,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownEventType => "unknown_event_type",
            Self::MalformedPayload => "malformed_payload",
            Self::MissingField => "missing_field",
            Self::UnknownTier => "unknown_tier",
            Self::UnknownReward => "unknown_reward",
            Self::GiftReceipt => "gift_receipt",
        }
    }
}

/// Stateless mapping from notifications to time deltas.
pub struct Interpreter;

impl Interpreter {
    pub fn interpret(envelope: &NotificationEnvelope, rates: &RateTable) -> Interpretation {
        match &envelope.event {
            NotificationEvent::Cheer(event) => match event.bits {
                Some(bits) => Interpretation::Delta(rates.cheer_seconds(bits)),
                None => Interpretation::Ignored(IgnoreReason::MissingField),
            },
            NotificationEvent::Follow(_) => Interpretation::Delta(rates.follow_seconds),
            NotificationEvent::Subscribe(event) => {
                // The originating gift notification earns the time for gifted subs.
                if event.is_gift {
                    return Interpretation::Ignored(IgnoreReason::GiftReceipt);
                }
                match resolve_tier(event.tier.as_deref()) {
                    Ok(tier) => rates
                        .subscription_seconds(tier)
                        .map(Interpretation::Delta)
                        .unwrap_or(Interpretation::Ignored(IgnoreReason::UnknownTier)),
                    Err(reason) => Interpretation::Ignored(reason),
                }
            }
            NotificationEvent::GiftSubscribe(event) => {
                match resolve_tier(event.tier.as_deref()) {
                    Ok(tier) => Interpretation::Gift {
                        tier,
                        count: event.total.unwrap_or(1).max(1),
                    },
                    Err(reason) => Interpretation::Ignored(reason),
                }
            }
            NotificationEvent::Reward(event) => match &event.reward {
                Some(reward) => rates
                    .reward_seconds(&reward.id)
                    .map(Interpretation::Delta)
                    .unwrap_or(Interpretation::Ignored(IgnoreReason::UnknownReward)),
                None => Interpretation::Ignored(IgnoreReason::MissingField),
            },
            NotificationEvent::Unknown { .. } => {
                Interpretation::Ignored(IgnoreReason::UnknownEventType)
            }
            NotificationEvent::Malformed { .. } => {
                Interpretation::Ignored(IgnoreReason::MalformedPayload)
            }
        }
    }
}

fn resolve_tier(raw: Option<&str>) -> Result<Tier, IgnoreReason> {
    let raw = raw.ok_or(IgnoreReason::MissingField)?;
    Tier::parse(raw).ok_or(IgnoreReason::UnknownTier)
}
