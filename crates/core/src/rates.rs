use std::collections::HashMap;

use crate::types::Tier;

/// Seconds keyed by subscription tier. Unconfigured tiers resolve to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierRates {
    seconds: HashMap<Tier, u64>,
}

impl TierRates {
    pub fn new(tier1: u64, tier2: u64, tier3: u64) -> Self {
        let mut seconds = HashMap::new();
        seconds.insert(Tier::Tier1, tier1);
        seconds.insert(Tier::Tier2, tier2);
        seconds.insert(Tier::Tier3, tier3);
        Self { seconds }
    }

    pub fn with(mut self, tier: Tier, seconds: u64) -> Self {
        self.seconds.insert(tier, seconds);
        self
    }

    pub fn get(&self, tier: Tier) -> Option<u64> {
        self.seconds.get(&tier).copied()
    }
}

/// Exchange rates converting platform events into seconds.
///
/// Loaded once at startup and shared read-only by the interpreter and the
/// gift aggregation window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    pub cheer_seconds_per_bit: f64,
    pub follow_seconds: u64,
    pub subscription_seconds: TierRates,
    pub bulk_gift_seconds: TierRates,
    pub bulk_gift_threshold: u64,
    pub reward_seconds: HashMap<String, u64>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            cheer_seconds_per_bit: 0.0,
            follow_seconds: 0,
            subscription_seconds: TierRates::default(),
            bulk_gift_seconds: TierRates::default(),
            bulk_gift_threshold: u64::MAX,
            reward_seconds: HashMap::new(),
        }
    }
}

impl RateTable {
    /// Seconds for `bits`, rounded to the nearest whole second.
    pub fn cheer_seconds(&self, bits: u64) -> u64 {
        let seconds = bits as f64 * self.cheer_seconds_per_bit;
        if seconds.is_finite() && seconds > 0.0 {
            seconds.round() as u64
        } else {
            0
        }
    }

    pub fn subscription_seconds(&self, tier: Tier) -> Option<u64> {
        self.subscription_seconds.get(tier)
    }

    pub fn reward_seconds(&self, reward_id: &str) -> Option<u64> {
        self.reward_seconds.get(reward_id).copied()
    }

    /// Consolidated seconds for `count` gifted subscriptions of `tier`.
    ///
    /// Batches at or above the bulk threshold earn the bulk per-unit rate,
    /// smaller batches earn the regular subscription rate per unit.
    pub fn gift_batch_seconds(&self, tier: Tier, count: u64) -> Option<u64> {
        let per_unit = if count >= self.bulk_gift_threshold {
            self.bulk_gift_seconds.get(tier)?
        } else {
            self.subscription_seconds.get(tier)?
        };
        Some(per_unit.saturating_mul(count))
    }
}
