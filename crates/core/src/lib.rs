//! Domain logic for the subathon timer: turning EventSub notifications into
//! seconds and keeping the authoritative countdown state.
//!
//! Nothing in this crate performs I/O or reads a clock; callers inject time.

pub mod dedup;
pub mod gift_window;
pub mod interpreter;
pub mod rates;
pub mod timer;
pub mod types;

pub use dedup::DedupGate;
pub use gift_window::{GiftObservation, GiftPhase, GiftSettlement, GiftWindow, GiftWindowConfig};
pub use interpreter::{IgnoreReason, Interpretation, Interpreter, TimeDelta};
pub use rates::{RateTable, TierRates};
pub use timer::{AppliedDelta, TickOutcome, TimerAccumulator};
pub use types::{EnvelopeError, NotificationEnvelope, NotificationEvent, Tier, TimerSnapshot};
