use std::time::Duration;

use metrics::{counter, gauge};
use serde_json::json;
use subathon_core::{
    AppliedDelta, DedupGate, GiftSettlement, GiftWindow, IgnoreReason, Interpretation,
    Interpreter, NotificationEnvelope, NotificationEvent, RateTable, TickOutcome,
    TimerAccumulator, TimerSnapshot,
};
use subathon_util::TimerConfig;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant, Interval},
};
use tracing::{debug, info, warn};

use crate::hub::{BroadcastHub, ClientConnection, ConnectionId};
use crate::protocol::{ServerEvent, StateReply, Tick, TimeChanged, TimerSync};
use crate::tap::{StageEvent, StageKind, TapHub};

const COMMAND_BUFFER: usize = 1024;
const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timer engine is not running")]
    Closed,
}

impl<T> From<mpsc::error::SendError<T>> for EngineError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Closed
    }
}

impl From<oneshot::error::RecvError> for EngineError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::Closed
    }
}

/// What the engine did with one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Duplicate,
    Applied(AppliedDelta),
    Batched { pending_count: u64 },
    Ignored(IgnoreReason),
}

impl IngressOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Applied(_) => "applied",
            Self::Batched { .. } => "batched",
            Self::Ignored(_) => "ignored",
        }
    }
}

enum EngineCommand {
    Notification {
        envelope: Box<NotificationEnvelope>,
        reply: oneshot::Sender<IngressOutcome>,
    },
    Register {
        connection: ClientConnection,
    },
    Unregister {
        id: ConnectionId,
    },
    Pause,
    Resume,
    AddTime {
        amount: i64,
        reply: oneshot::Sender<Option<AppliedDelta>>,
    },
    Snapshot {
        reply: oneshot::Sender<TimerSnapshot>,
    },
    QueryFor {
        id: ConnectionId,
        request_id: Option<String>,
    },
    Shutdown,
}

/// Cloneable entry point for every task that needs the timer.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Dedups, interprets and applies one notification.
    pub async fn ingest(
        &self,
        envelope: NotificationEnvelope,
    ) -> Result<IngressOutcome, EngineError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(EngineCommand::Notification {
                envelope: Box::new(envelope),
                reply,
            })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn register(&self, connection: ClientConnection) -> Result<(), EngineError> {
        self.sender
            .send(EngineCommand::Register { connection })
            .await?;
        Ok(())
    }

    /// Non-blocking so it can run from `Drop`.
    pub fn unregister(&self, id: ConnectionId) {
        if let Err(err) = self.sender.try_send(EngineCommand::Unregister { id }) {
            debug!(stage = "hub", %id, error = %err, "unregister not delivered, client will be pruned on next send");
        }
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.sender.send(EngineCommand::Pause).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.sender.send(EngineCommand::Resume).await?;
        Ok(())
    }

    /// Manual injection. Returns `None` when the amount was rejected.
    pub async fn add_time(&self, amount: i64) -> Result<Option<AppliedDelta>, EngineError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(EngineCommand::AddTime { amount, reply })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn snapshot(&self) -> Result<TimerSnapshot, EngineError> {
        let (reply, receiver) = oneshot::channel();
        self.sender.send(EngineCommand::Snapshot { reply }).await?;
        Ok(receiver.await?)
    }

    /// Answers a client query through that client's own event stream.
    pub async fn query_for(
        &self,
        id: ConnectionId,
        request_id: Option<String>,
    ) -> Result<(), EngineError> {
        self.sender
            .send(EngineCommand::QueryFor { id, request_id })
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.sender.send(EngineCommand::Shutdown).await?;
        Ok(())
    }
}

enum Step {
    Tick,
    GiftDeadline(Instant),
    Command(Option<EngineCommand>),
}

/// Owns all mutable timer state and processes every trigger in queue order.
pub struct Engine {
    timer: TimerAccumulator,
    gifts: GiftWindow,
    dedup: DedupGate,
    hub: BroadcastHub,
    rates: RateTable,
    tap: TapHub,
    ticker: Option<Interval>,
}

impl Engine {
    pub fn new(config: &TimerConfig, tap: TapHub) -> Self {
        let mut timer = TimerAccumulator::new(config.starting_seconds, config.max_cap_seconds);
        if config.start_running {
            timer.resume();
        }
        Self {
            timer,
            gifts: GiftWindow::new(config.gift_window),
            dedup: DedupGate::new(config.dedup_capacity, config.dedup_ttl),
            hub: BroadcastHub::new(),
            rates: config.rates.clone(),
            tap,
            ticker: None,
        }
    }

    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(receiver));
        (EngineHandle { sender }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let snapshot = self.timer.snapshot();
        info!(
            stage = "timer",
            remaining_seconds = snapshot.remaining_seconds,
            max_cap = snapshot.max_cap,
            running = snapshot.running,
            "timer engine started"
        );
        self.record_state();
        self.sync_ticker();

        loop {
            let gift_deadline = self.gifts.deadline().map(Instant::from_std);
            let step = tokio::select! {
                biased;
                _ = next_tick(&mut self.ticker) => Step::Tick,
                deadline = wait_until(gift_deadline) => Step::GiftDeadline(deadline),
                command = commands.recv() => Step::Command(command),
            };

            match step {
                Step::Tick => self.on_tick(),
                Step::GiftDeadline(deadline) => self.on_gift_deadline(deadline),
                Step::Command(Some(EngineCommand::Shutdown)) | Step::Command(None) => break,
                Step::Command(Some(command)) => self.dispatch(command),
            }
            self.sync_ticker();
        }

        if let Some(batch) = self.gifts.discard() {
            warn!(
                stage = "gift",
                pending_count = batch.pending_count,
                tier = %batch.tier,
                "open gift batch discarded on shutdown"
            );
        }
        info!(stage = "timer", "timer engine stopped");
    }

    fn dispatch(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Notification { envelope, reply } => {
                let outcome = self.on_notification(&envelope);
                let _ = reply.send(outcome);
            }
            EngineCommand::Register { connection } => {
                let id = connection.id;
                let transport = connection.transport;
                let state = TimerSync::from(self.timer.snapshot());
                let accepted = self.hub.register(connection, state);
                self.publish_hub(
                    "registered",
                    json!({
                        "id": id,
                        "transport": transport.as_str(),
                        "accepted": accepted,
                        "clients": self.hub.len(),
                    }),
                );
            }
            EngineCommand::Unregister { id } => {
                if let Some(connection) = self.hub.unregister(id) {
                    self.publish_hub(
                        "unregistered",
                        json!({
                            "id": id,
                            "transport": connection.transport.as_str(),
                            "clients": self.hub.len(),
                        }),
                    );
                }
            }
            EngineCommand::Pause => {
                if self.timer.pause() {
                    info!(stage = "timer", remaining_seconds = self.timer.snapshot().remaining_seconds, "timer paused");
                    self.broadcast_sync();
                }
            }
            EngineCommand::Resume => {
                if self.timer.resume() {
                    info!(stage = "timer", remaining_seconds = self.timer.snapshot().remaining_seconds, "timer resumed");
                    self.broadcast_sync();
                }
            }
            EngineCommand::AddTime { amount, reply } => {
                let applied = self.on_manual_add(amount);
                let _ = reply.send(applied);
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.timer.snapshot());
            }
            EngineCommand::QueryFor { id, request_id } => {
                let snapshot = self.timer.snapshot();
                self.hub.send_to(
                    id,
                    ServerEvent::State(StateReply {
                        id: request_id,
                        remaining_seconds: snapshot.remaining_seconds,
                        running: snapshot.running,
                    }),
                );
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn on_notification(&mut self, envelope: &NotificationEnvelope) -> IngressOutcome {
        let now = Instant::now().into_std();
        let message_id = envelope.message_id.as_str();

        if !self.dedup.check_and_mark(message_id, now) {
            counter!("eventsub_duplicate_total").increment(1);
            info!(stage = "ingress", %message_id, event_type = %envelope.event_type, "duplicate notification skipped");
            return IngressOutcome::Duplicate;
        }

        let interpretation = Interpreter::interpret(envelope, &self.rates);
        self.tap.publish(
            StageEvent::new(
                StageKind::Interpreter,
                envelope.event.kind_str(),
                interpretation.redacted(),
            )
            .with_message_id(message_id)
            .with_event_type(&envelope.event_type),
        );

        match interpretation {
            Interpretation::Delta(seconds) => {
                info!(
                    stage = "interpreter",
                    %message_id,
                    kind = envelope.event.kind_str(),
                    actor = envelope.event.actor_login().unwrap_or("anonymous"),
                    seconds,
                    "notification converted to time"
                );
                IngressOutcome::Applied(self.apply_delta(seconds, envelope.event.kind_str()))
            }
            Interpretation::Gift { tier, count } => {
                let observed = self.gifts.observe(tier, count, now, &self.rates);
                if let Some(settlement) = observed.settled {
                    self.apply_settlement(settlement);
                }
                info!(
                    stage = "gift",
                    %message_id,
                    actor = envelope.event.actor_login().unwrap_or("anonymous"),
                    %tier,
                    count,
                    pending_count = observed.pending_count,
                    opened = observed.opened,
                    "gift notification batched"
                );
                self.tap.publish(
                    StageEvent::new(
                        StageKind::Gift,
                        if observed.opened { "opened" } else { "extended" },
                        json!({ "tier": tier.as_str(), "pending_count": observed.pending_count }),
                    )
                    .with_message_id(message_id),
                );
                IngressOutcome::Batched {
                    pending_count: observed.pending_count,
                }
            }
            Interpretation::Ignored(reason) => {
                counter!("interpreter_ignored_total", "reason" => reason.as_str()).increment(1);
                match &envelope.event {
                    NotificationEvent::Malformed { reason: detail, .. } => warn!(
                        stage = "interpreter",
                        %message_id,
                        event_type = %envelope.event_type,
                        error = %detail,
                        "malformed payload, no time applied"
                    ),
                    _ => info!(
                        stage = "interpreter",
                        %message_id,
                        event_type = %envelope.event_type,
                        reason = reason.as_str(),
                        "notification ignored"
                    ),
                }
                IngressOutcome::Ignored(reason)
            }
        }
    }

    fn on_manual_add(&mut self, amount: i64) -> Option<AppliedDelta> {
        if amount <= 0 {
            warn!(stage = "timer", amount, "manual add rejected, amount must be positive");
            return None;
        }
        Some(self.apply_delta(amount as u64, "manual"))
    }

    fn apply_settlement(&mut self, settlement: GiftSettlement) {
        counter!("gift_batches_total").increment(1);
        self.tap.publish(StageEvent::new(
            StageKind::Gift,
            "settled",
            json!({
                "tier": settlement.tier.as_str(),
                "count": settlement.count,
                "bulk": settlement.bulk,
                "seconds": settlement.seconds,
            }),
        ));
        match settlement.seconds {
            Some(seconds) => {
                info!(
                    stage = "gift",
                    tier = %settlement.tier,
                    count = settlement.count,
                    bulk = settlement.bulk,
                    seconds,
                    "gift batch settled"
                );
                self.apply_delta(seconds, "gift_batch");
            }
            None => warn!(
                stage = "gift",
                tier = %settlement.tier,
                count = settlement.count,
                "gift batch settled without a configured rate"
            ),
        }
    }

    fn apply_delta(&mut self, seconds: u64, source: &'static str) -> AppliedDelta {
        let applied = self.timer.add_time(seconds);
        counter!("timer_seconds_awarded_total", "source" => source).increment(applied.applied);

        if applied.clamped() {
            counter!("timer_clamped_total").increment(1);
            info!(
                stage = "timer",
                source,
                requested = applied.requested,
                applied = applied.applied,
                total_awarded = applied.total_awarded,
                capped = self.timer.is_capped(),
                "delta clamped at cap"
            );
        }

        if !applied.is_noop() {
            self.broadcast(&ServerEvent::TimeChanged(TimeChanged {
                remaining_seconds: applied.remaining_seconds,
                delta_applied: applied.applied,
            }));
            self.record_state();
        }

        self.tap.publish(StageEvent::new(
            StageKind::Timer,
            source,
            json!({
                "requested": applied.requested,
                "applied": applied.applied,
                "remaining_seconds": applied.remaining_seconds,
                "total_awarded": applied.total_awarded,
            }),
        ));
        applied
    }

    fn on_tick(&mut self) {
        match self.timer.tick() {
            TickOutcome::Idle => {}
            TickOutcome::Decremented { remaining_seconds } => {
                self.broadcast(&ServerEvent::Tick(Tick { remaining_seconds }));
                self.record_state();
            }
            TickOutcome::Expired => {
                self.broadcast(&ServerEvent::Tick(Tick {
                    remaining_seconds: 0,
                }));
                self.broadcast(&ServerEvent::Expired);
                self.record_state();
                counter!("timer_expired_total").increment(1);
                info!(stage = "timer", "countdown expired");
                self.tap
                    .publish(StageEvent::new(StageKind::Timer, "expired", json!({})));
            }
        }
    }

    fn on_gift_deadline(&mut self, deadline: Instant) {
        let now = Instant::now().max(deadline).into_std();
        if let Some(settlement) = self.gifts.settle_due(now, &self.rates) {
            self.apply_settlement(settlement);
        }
    }

    // Ticks are scheduled only while running with time left. Dropping the
    // interval cancels future ticks; a tick already dispatched has completed.
    fn sync_ticker(&mut self) {
        match (self.ticker.is_some(), self.timer.should_tick()) {
            (false, true) => {
                self.ticker = Some(interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD));
                debug!(stage = "timer", "countdown scheduled");
            }
            (true, false) => {
                self.ticker = None;
                debug!(stage = "timer", "countdown stopped");
            }
            _ => {}
        }
    }

    fn broadcast_sync(&mut self) {
        let state = TimerSync::from(self.timer.snapshot());
        self.broadcast(&ServerEvent::Sync(state));
        self.record_state();
    }

    fn broadcast(&mut self, event: &ServerEvent) {
        let report = self.hub.broadcast(event);
        debug!(
            stage = "hub",
            event = event.name(),
            clients = self.hub.len(),
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "event broadcast"
        );
        for id in report.dropped {
            self.publish_hub(
                "dropped",
                json!({ "id": id, "event": event.name(), "clients": self.hub.len() }),
            );
        }
    }

    fn publish_hub(&self, message: &'static str, payload: serde_json::Value) {
        self.tap
            .publish(StageEvent::new(StageKind::Hub, message, payload));
    }

    fn record_state(&self) {
        let snapshot = self.timer.snapshot();
        gauge!("timer_remaining_seconds").set(snapshot.remaining_seconds as f64);
        gauge!("timer_total_awarded_seconds").set(snapshot.total_awarded as f64);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) -> Instant {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(deadline).await;
            deadline
        }
        None => std::future::pending().await,
    }
}
