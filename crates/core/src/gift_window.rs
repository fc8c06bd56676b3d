//! Debounced aggregation of gifted-subscription bursts.
//!
//! A bulk gift purchase arrives as a rapid series of notifications. The
//! window merges them into one batch so the bulk rate applies once to the
//! whole purchase.
//!
//! # State Machine
//!
//! ```text
//!         observe()                 quiet period elapsed
//!  Idle ────────────► Accumulating ───────────────────► Settling ──► Idle
//!                       │    ▲        (or max window)
//!                       └────┘
//!                      observe()
//!                   (resets quiet period)
//! ```
//!
//! The window never reads a clock. Callers pass `now` into every operation
//! and ask [`GiftWindow::deadline`] when to come back, which keeps the
//! aggregation logic testable without real waits.

use std::time::{Duration, Instant};

use crate::rates::RateTable;
use crate::types::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiftWindowConfig {
    /// Quiet time after the last arrival before the batch settles.
    pub quiet_period: Duration,
    /// Upper bound on how long a batch may stay open.
    pub max_window: Duration,
}

impl Default for GiftWindowConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1000),
            max_window: Duration::from_secs(10),
        }
    }
}

/// The currently open batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiftBatch {
    pub pending_count: u64,
    /// Tier of the most recent arrival.
    pub tier: Tier,
    pub opened_at: Instant,
    pub last_arrival: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiftPhase {
    Idle,
    Accumulating,
}

/// Consolidated result of a closed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiftSettlement {
    pub tier: Tier,
    pub count: u64,
    /// `None` when the batch tier has no configured rate.
    pub seconds: Option<u64>,
    pub bulk: bool,
}

/// What happened to the window when a gift arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiftObservation {
    /// A previous batch that was overdue and closed before this arrival.
    pub settled: Option<GiftSettlement>,
    pub opened: bool,
    pub pending_count: u64,
}

#[derive(Debug)]
pub struct GiftWindow {
    config: GiftWindowConfig,
    batch: Option<GiftBatch>,
}

impl GiftWindow {
    pub fn new(config: GiftWindowConfig) -> Self {
        Self {
            config,
            batch: None,
        }
    }

    pub fn phase(&self) -> GiftPhase {
        match self.batch {
            Some(_) => GiftPhase::Accumulating,
            None => GiftPhase::Idle,
        }
    }

    /// Records `count` gifted subscriptions of `tier` arriving at `now`.
    ///
    /// A tier change mid-window merges into the open batch under the later tier.
    pub fn observe(
        &mut self,
        tier: Tier,
        count: u64,
        now: Instant,
        rates: &RateTable,
    ) -> GiftObservation {
        let settled = self.settle_due(now, rates);

        match self.batch.as_mut() {
            Some(batch) => {
                batch.pending_count = batch.pending_count.saturating_add(count);
                batch.tier = tier;
                batch.last_arrival = now;
                GiftObservation {
                    settled,
                    opened: false,
                    pending_count: batch.pending_count,
                }
            }
            None => {
                self.batch = Some(GiftBatch {
                    pending_count: count,
                    tier,
                    opened_at: now,
                    last_arrival: now,
                });
                GiftObservation {
                    settled,
                    opened: true,
                    pending_count: count,
                }
            }
        }
    }

    /// Instant at which the open batch settles, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch.map(|batch| {
            let quiet = batch.last_arrival + self.config.quiet_period;
            let hard = batch.opened_at + self.config.max_window;
            quiet.min(hard)
        })
    }

    /// Closes the batch when its deadline has passed and returns the consolidated delta.
    pub fn settle_due(&mut self, now: Instant, rates: &RateTable) -> Option<GiftSettlement> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let batch = self.batch.take()?;
        Some(GiftSettlement {
            tier: batch.tier,
            count: batch.pending_count,
            seconds: rates.gift_batch_seconds(batch.tier, batch.pending_count),
            bulk: batch.pending_count >= rates.bulk_gift_threshold,
        })
    }

    /// Drops the open batch without settling it.
    pub fn discard(&mut self) -> Option<GiftBatch> {
        self.batch.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::TierRates;

    fn rates() -> RateTable {
        RateTable {
            subscription_seconds: TierRates::new(30, 60, 150),
            bulk_gift_seconds: TierRates::new(20, 40, 100),
            bulk_gift_threshold: 5,
            ..RateTable::default()
        }
    }

    fn window() -> GiftWindow {
        GiftWindow::new(GiftWindowConfig {
            quiet_period: Duration::from_millis(500),
            max_window: Duration::from_secs(5),
        })
    }

    #[test]
    fn burst_above_threshold_settles_once_at_bulk_rate() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();

        for i in 0..6 {
            let observed = window.observe(
                Tier::Tier1,
                1,
                start + Duration::from_millis(50 * i),
                &rates,
            );
            assert_eq!(observed.settled, None);
            assert_eq!(observed.opened, i == 0);
        }
        assert_eq!(window.phase(), GiftPhase::Accumulating);

        let last = start + Duration::from_millis(250);
        assert_eq!(
            window.settle_due(last + Duration::from_millis(499), &rates),
            None
        );

        let settlement = window
            .settle_due(last + Duration::from_millis(500), &rates)
            .expect("settled");
        assert_eq!(settlement.count, 6);
        assert_eq!(settlement.seconds, Some(120));
        assert!(settlement.bulk);
        assert_eq!(window.phase(), GiftPhase::Idle);
        assert_eq!(window.deadline(), None);
    }

    #[test]
    fn small_burst_uses_subscription_rate() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();
        window.observe(Tier::Tier2, 2, start, &rates);

        let settlement = window
            .settle_due(start + Duration::from_secs(1), &rates)
            .expect("settled");
        assert_eq!(settlement.seconds, Some(120));
        assert!(!settlement.bulk);
    }

    #[test]
    fn arrivals_extend_the_quiet_period() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();
        window.observe(Tier::Tier1, 1, start, &rates);
        window.observe(Tier::Tier1, 1, start + Duration::from_millis(400), &rates);

        assert_eq!(
            window.deadline(),
            Some(start + Duration::from_millis(900))
        );
    }

    #[test]
    fn max_window_bounds_a_runaway_stream() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();
        for i in 0..60 {
            let observed = window.observe(
                Tier::Tier1,
                1,
                start + Duration::from_millis(100 * i),
                &rates,
            );
            if i == 50 {
                let settled = observed.settled.expect("max window reached");
                assert_eq!(settled.count, 50);
                assert!(observed.opened);
            } else {
                assert_eq!(observed.settled, None);
            }
        }
    }

    #[test]
    fn arrival_after_close_starts_a_new_batch() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();
        window.observe(Tier::Tier1, 3, start, &rates);

        let observed = window.observe(Tier::Tier1, 1, start + Duration::from_secs(2), &rates);
        let settled = observed.settled.expect("previous batch closed");
        assert_eq!(settled.count, 3);
        assert_eq!(settled.seconds, Some(90));
        assert!(observed.opened);
        assert_eq!(observed.pending_count, 1);
    }

    #[test]
    fn tier_change_merges_under_later_tier() {
        let rates = rates();
        let mut window = window();
        let start = Instant::now();
        window.observe(Tier::Tier1, 1, start, &rates);
        window.observe(Tier::Tier3, 1, start + Duration::from_millis(10), &rates);

        let settlement = window
            .settle_due(start + Duration::from_secs(1), &rates)
            .expect("settled");
        assert_eq!(settlement.tier, Tier::Tier3);
        assert_eq!(settlement.seconds, Some(300));
    }

    #[test]
    fn discard_drops_pending_batch() {
        let rates = rates();
        let mut window = window();
        window.observe(Tier::Tier1, 4, Instant::now(), &rates);

        let dropped = window.discard().expect("batch");
        assert_eq!(dropped.pending_count, 4);
        assert_eq!(window.phase(), GiftPhase::Idle);
    }
}
