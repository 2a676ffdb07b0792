//! Telemetry cache and fan-out.
//!
//! Singleton kinds (`account`, `system_status`) are overwritten on ingest and
//! flushed to subscribers on a fixed timer that only runs while someone is
//! subscribed. Collection and stream kinds are republished immediately.
//! Trades and alarms keep a bounded recent window replayed to new
//! subscribers. Orders leave the cache once their terminal update has been
//! published.

use crate::config::AggregatorConfig;
use crate::ipc::{Envelope, MessageType};
use crate::models::OrderStatus;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Cached telemetry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Account,
    SystemStatus,
    Position,
    Order,
    Tick,
    Trade,
    Alarm,
}

impl TelemetryKind {
    pub fn from_message(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::Account => Some(TelemetryKind::Account),
            MessageType::SystemStatus => Some(TelemetryKind::SystemStatus),
            MessageType::Position => Some(TelemetryKind::Position),
            MessageType::Order => Some(TelemetryKind::Order),
            MessageType::Tick => Some(TelemetryKind::Tick),
            MessageType::Trade => Some(TelemetryKind::Trade),
            MessageType::Alarm => Some(TelemetryKind::Alarm),
            _ => None,
        }
    }

    /// Published on the flush timer instead of on ingest.
    pub fn is_batched(&self) -> bool {
        matches!(self, TelemetryKind::Account | TelemetryKind::SystemStatus)
    }

    /// Field identifying one item of a collection kind.
    fn item_key_field(&self) -> Option<&'static str> {
        match self {
            TelemetryKind::Position | TelemetryKind::Tick => Some("symbol"),
            TelemetryKind::Order => Some("order_id"),
            _ => None,
        }
    }
}

/// One published update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub account_id: String,
    pub kind: TelemetryKind,
    /// Item key for collection kinds and trade id for trades.
    pub key: Option<String>,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

/// Which accounts a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Account(String),
}

impl SubscriptionFilter {
    fn matches(&self, account_id: &str) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Account(id) => id == account_id,
        }
    }
}

enum Command {
    Ingest {
        account_id: String,
        envelope: Envelope,
    },
    Read {
        account_id: String,
        kind: TelemetryKind,
        reply: oneshot::Sender<Vec<Telemetry>>,
    },
    Subscribe {
        filter: SubscriptionFilter,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: u64,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
    Forget {
        account_id: String,
    },
    Shutdown,
}

/// Handle to the aggregator task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AggregatorHandle {
    /// Cache (and possibly publish) one pushed envelope. Never blocks.
    pub fn ingest(&self, account_id: &str, envelope: Envelope) {
        let cmd = Command::Ingest {
            account_id: account_id.to_string(),
            envelope,
        };
        if self.tx.send(cmd).is_err() {
            debug!(%account_id, "Aggregator stopped, dropping envelope");
        }
    }

    /// Current cached value (singletons) or collection for one account.
    pub async fn read(&self, account_id: &str, kind: TelemetryKind) -> Vec<Telemetry> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Read {
            account_id: account_id.to_string(),
            kind,
            reply,
        };
        if self.tx.send(cmd).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Start receiving updates. Returns `None` once the aggregator stopped.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Subscribe { filter, reply }).ok()?;
        rx.await.ok()
    }

    pub async fn subscriber_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::SubscriberCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Drop everything cached for an account that is gone for good.
    pub fn forget_account(&self, account_id: &str) {
        let cmd = Command::Forget {
            account_id: account_id.to_string(),
        };
        if self.tx.send(cmd).is_err() {
            debug!(%account_id, "Aggregator stopped, nothing to forget");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Lazy, unbounded sequence of published updates.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Telemetry>,
    control: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Telemetry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Telemetry> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Telemetry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.control.send(Command::Unsubscribe { id: self.id });
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<Telemetry>,
}

type SingletonKey = (String, TelemetryKind);

/// Aggregator task state.
pub struct Aggregator {
    config: AggregatorConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    singletons: HashMap<SingletonKey, Telemetry>,
    dirty: HashSet<SingletonKey>,
    collections: HashMap<SingletonKey, BTreeMap<String, Telemetry>>,
    windows: HashMap<SingletonKey, VecDeque<Telemetry>>,
    last_seq: HashMap<String, u64>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber_id: u64,
    flush_timer: Option<Interval>,
}

enum Wake {
    Command(Option<Command>),
    Flush,
}

impl Aggregator {
    /// Spawn the aggregator task.
    pub fn spawn(config: AggregatorConfig) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            config,
            rx,
            tx: tx.clone(),
            singletons: HashMap::new(),
            dirty: HashSet::new(),
            collections: HashMap::new(),
            windows: HashMap::new(),
            last_seq: HashMap::new(),
            subscribers: BTreeMap::new(),
            next_subscriber_id: 1,
            flush_timer: None,
        };
        let task = tokio::spawn(aggregator.run());
        (AggregatorHandle { tx }, task)
    }

    async fn run(mut self) {
        loop {
            let wake = match self.flush_timer.as_mut() {
                Some(timer) => tokio::select! {
                    cmd = self.rx.recv() => Wake::Command(cmd),
                    _ = timer.tick() => Wake::Flush,
                },
                None => Wake::Command(self.rx.recv().await),
            };

            match wake {
                Wake::Flush => self.flush(),
                Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => self.handle(cmd),
            }
        }

        self.flush_timer = None;
        self.subscribers.clear();
        info!("Aggregator stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Ingest {
                account_id,
                envelope,
            } => self.ingest(&account_id, envelope),
            Command::Read {
                account_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.read(&account_id, kind));
            }
            Command::Subscribe { filter, reply } => {
                let subscription = self.subscribe(filter);
                // A caller that went away drops the subscription, which
                // unsubscribes it again.
                let _ = reply.send(subscription);
            }
            Command::Unsubscribe { id } => self.unsubscribe(id),
            Command::SubscriberCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            Command::Forget { account_id } => self.forget(&account_id),
            Command::Shutdown => {}
        }
    }

    fn ingest(&mut self, account_id: &str, envelope: Envelope) {
        let message_type = match envelope.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(%account_id, error = %e, "Aggregator dropping envelope");
                return;
            }
        };

        if message_type == MessageType::Register {
            // New connection, new sequence space.
            self.last_seq.remove(account_id);
            return;
        }

        let Some(kind) = TelemetryKind::from_message(message_type) else {
            return;
        };

        if let Some(seq) = envelope.seq {
            if let Some(&last) = self.last_seq.get(account_id) {
                if seq <= last {
                    debug!(%account_id, seq, last, msg_type = %message_type, "Dropping duplicate delivery");
                    return;
                }
            }
            self.last_seq.insert(account_id.to_string(), seq);
        }

        let mut telemetry = Telemetry {
            account_id: account_id.to_string(),
            kind,
            key: None,
            data: envelope.data,
            received_at: Utc::now(),
        };
        let slot = (account_id.to_string(), kind);

        match kind {
            TelemetryKind::Account | TelemetryKind::SystemStatus => {
                self.singletons.insert(slot.clone(), telemetry);
                self.dirty.insert(slot);
            }
            TelemetryKind::Position | TelemetryKind::Order | TelemetryKind::Tick => {
                let field = kind.item_key_field().unwrap_or("symbol");
                let Some(key) = telemetry.data.get(field).and_then(Value::as_str) else {
                    warn!(%account_id, ?kind, field, "Telemetry without item key");
                    return;
                };
                let key = key.to_string();
                telemetry.key = Some(key.clone());
                let items = self.collections.entry(slot).or_default();
                if kind == TelemetryKind::Order && is_terminal_order(&telemetry.data) {
                    items.remove(&key);
                } else {
                    items.insert(key, telemetry.clone());
                }
                self.publish(&telemetry);
            }
            TelemetryKind::Trade => {
                let trade_id = telemetry
                    .data
                    .get("trade_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let window = self.windows.entry(slot).or_default();
                if let Some(id) = &trade_id {
                    if window.iter().any(|t| t.key.as_deref() == Some(id.as_str())) {
                        debug!(%account_id, trade_id = %id, "Dropping duplicate trade");
                        return;
                    }
                }
                telemetry.key = trade_id;
                push_bounded(window, telemetry.clone(), self.config.trade_window);
                self.publish(&telemetry);
            }
            TelemetryKind::Alarm => {
                telemetry.key = telemetry
                    .data
                    .get("alarm_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let window = self.windows.entry(slot).or_default();
                push_bounded(window, telemetry.clone(), self.config.alarm_window);
                self.publish(&telemetry);
            }
        }
    }

    fn forget(&mut self, account_id: &str) {
        self.singletons.retain(|(id, _), _| id != account_id);
        self.dirty.retain(|(id, _)| id != account_id);
        self.collections.retain(|(id, _), _| id != account_id);
        self.windows.retain(|(id, _), _| id != account_id);
        self.last_seq.remove(account_id);
        info!(%account_id, "Cached telemetry dropped");
    }

    fn read(&self, account_id: &str, kind: TelemetryKind) -> Vec<Telemetry> {
        let slot = (account_id.to_string(), kind);
        match kind {
            TelemetryKind::Account | TelemetryKind::SystemStatus => {
                self.singletons.get(&slot).cloned().into_iter().collect()
            }
            TelemetryKind::Position | TelemetryKind::Order | TelemetryKind::Tick => self
                .collections
                .get(&slot)
                .map(|items| items.values().cloned().collect())
                .unwrap_or_default(),
            TelemetryKind::Trade | TelemetryKind::Alarm => self
                .windows
                .get(&slot)
                .map(|window| window.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn subscribe(&mut self, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay recent trades and alarms, oldest first.
        let mut replay: Vec<&Telemetry> = self
            .windows
            .iter()
            .filter(|((account_id, _), _)| filter.matches(account_id))
            .flat_map(|(_, window)| window.iter())
            .collect();
        replay.sort_by_key(|t| t.received_at);
        for telemetry in replay {
            let _ = tx.send(telemetry.clone());
        }

        self.subscribers.insert(id, Subscriber { filter, tx });
        if self.flush_timer.is_none() {
            self.start_flush_timer();
        }
        debug!(id, subscribers = self.subscribers.len(), "Subscriber added");

        Subscription {
            id,
            rx,
            control: self.tx.clone(),
        }
    }

    fn unsubscribe(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            debug!(id, subscribers = self.subscribers.len(), "Subscriber removed");
        }
        self.stop_flush_timer_if_idle();
    }

    fn start_flush_timer(&mut self) {
        let period = self.config.account_flush_interval();
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.flush_timer = Some(timer);
        debug!(?period, "Flush timer started");
    }

    fn stop_flush_timer_if_idle(&mut self) {
        if self.subscribers.is_empty() && self.flush_timer.take().is_some() {
            debug!("Flush timer stopped");
        }
    }

    /// Publish every singleton that changed since the previous flush.
    fn flush(&mut self) {
        let mut slots: Vec<SingletonKey> = self.dirty.drain().collect();
        slots.sort();
        for slot in slots {
            if let Some(telemetry) = self.singletons.get(&slot).cloned() {
                self.publish(&telemetry);
            }
        }
    }

    fn publish(&mut self, telemetry: &Telemetry) {
        let mut gone = Vec::new();
        for (id, subscriber) in &self.subscribers {
            if subscriber.filter.matches(&telemetry.account_id)
                && subscriber.tx.send(telemetry.clone()).is_err()
            {
                gone.push(*id);
            }
        }
        for id in gone {
            self.subscribers.remove(&id);
        }
        self.stop_flush_timer_if_idle();
    }
}

fn is_terminal_order(data: &Value) -> bool {
    data.get("status")
        .cloned()
        .and_then(|status| serde_json::from_value::<OrderStatus>(status).ok())
        .is_some_and(|status| status.is_terminal())
}

fn push_bounded(window: &mut VecDeque<Telemetry>, telemetry: Telemetry, capacity: usize) {
    window.push_back(telemetry);
    while window.len() > capacity.max(1) {
        window.pop_front();
    }
}
