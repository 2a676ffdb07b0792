//! Runtime registry of managed accounts.
//!
//! One record per enabled account, owned by the supervisor task. A crash
//! changes a record's state; only disabling the account removes it.

use super::launcher::ProcessHandle;
use super::proxy::ExecutionProxy;
use crate::config::AccountConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Lifecycle state of one execution process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Restarting,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Degraded => "DEGRADED",
            ProcessState::Restarting => "RESTARTING",
            ProcessState::Failed => "FAILED",
        }
    }

    /// Edges of the lifecycle state machine.
    pub fn can_transition_to(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Restarting)
                | (Starting, Stopped)
                | (Running, Degraded)
                | (Running, Stopped)
                | (Degraded, Running)
                | (Degraded, Restarting)
                | (Degraded, Stopped)
                | (Restarting, Running)
                | (Restarting, Failed)
                | (Restarting, Stopped)
                | (Failed, Stopped)
        )
    }

    /// States in which a process is expected to exist.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting
                | ProcessState::Running
                | ProcessState::Degraded
                | ProcessState::Restarting
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent traffic timestamp for one process incarnation.
///
/// The proxy touches it on every received envelope; the supervisor reads it
/// on health ticks.
#[derive(Debug, Clone)]
pub struct HeartbeatClock(Arc<watch::Sender<Option<Instant>>>);

impl HeartbeatClock {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(None).0))
    }

    pub fn touch(&self) {
        self.0.send_replace(Some(Instant::now()));
    }

    pub fn last(&self) -> Option<Instant> {
        *self.0.borrow()
    }

    /// Time since the last traffic, `None` if nothing arrived yet.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last().map(|at| now.saturating_duration_since(at))
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor bookkeeping for one account.
pub struct AccountRuntimeRecord {
    pub account_id: String,
    pub config: AccountConfig,
    pub desired_enabled: bool,
    pub state: ProcessState,
    pub state_since: Instant,
    pub state_changed_at: DateTime<Utc>,
    /// Incarnation counter; events tagged with an older value are stale.
    pub generation: u64,
    pub process: Option<Box<dyn ProcessHandle>>,
    pub proxy: Option<ExecutionProxy>,
    /// Connect-and-receive task of the current incarnation.
    pub io_task: Option<JoinHandle<()>>,
    pub heartbeat: HeartbeatClock,
    pub restart_count: u32,
    pub next_restart_backoff: Duration,
    /// Set while waiting out a restart backoff.
    pub restart_due_at: Option<Instant>,
    pub spawned_at: Option<Instant>,
    pub running_since: Option<Instant>,
    pub degraded_since: Option<Instant>,
    pub pid: Option<u32>,
}

impl AccountRuntimeRecord {
    pub fn new(config: AccountConfig) -> Self {
        Self {
            account_id: config.account_id.clone(),
            desired_enabled: config.enabled,
            config,
            state: ProcessState::Stopped,
            state_since: Instant::now(),
            state_changed_at: Utc::now(),
            generation: 0,
            process: None,
            proxy: None,
            io_task: None,
            heartbeat: HeartbeatClock::new(),
            restart_count: 0,
            next_restart_backoff: Duration::ZERO,
            restart_due_at: None,
            spawned_at: None,
            running_since: None,
            degraded_since: None,
            pid: None,
        }
    }

    /// Apply a lifecycle transition. Illegal edges are refused and logged.
    pub fn transition(&mut self, to: ProcessState) -> bool {
        let from = self.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!(
                account_id = %self.account_id,
                %from,
                %to,
                "Refusing illegal state transition"
            );
            return false;
        }

        let now = Instant::now();
        self.state = to;
        self.state_since = now;
        self.state_changed_at = Utc::now();
        match to {
            ProcessState::Running => {
                self.running_since = Some(now);
                self.degraded_since = None;
            }
            ProcessState::Degraded => {
                self.running_since = None;
                self.degraded_since = Some(now);
            }
            _ => {
                self.running_since = None;
                self.degraded_since = None;
            }
        }

        info!(account_id = %self.account_id, %from, %to, "Process state changed");
        true
    }

    /// Detach the current incarnation, leaving its connection open.
    pub fn detach_incarnation(&mut self) -> Incarnation {
        self.spawned_at = None;
        self.pid = None;
        Incarnation {
            process: self.process.take(),
            proxy: self.proxy.take(),
            io_task: self.io_task.take(),
        }
    }

    /// Detach the current incarnation and cut its connection.
    pub fn take_incarnation(&mut self) -> Incarnation {
        let mut incarnation = self.detach_incarnation();
        incarnation.disconnect();
        incarnation
    }

    pub fn status(&self, now: Instant) -> AccountStatus {
        AccountStatus {
            account_id: self.account_id.clone(),
            state: self.state,
            desired_enabled: self.desired_enabled,
            restart_count: self.restart_count,
            generation: self.generation,
            pid: self.pid,
            connected: self.proxy.as_ref().is_some_and(|p| !p.is_closed()),
            last_heartbeat_age_ms: self
                .heartbeat
                .age(now)
                .map(|age| age.as_millis() as u64),
            next_restart_backoff_ms: self.next_restart_backoff.as_millis() as u64,
            state_since: self.state_changed_at,
        }
    }
}

/// What was running for an account before it was torn down.
pub struct Incarnation {
    pub process: Option<Box<dyn ProcessHandle>>,
    pub proxy: Option<ExecutionProxy>,
    pub io_task: Option<JoinHandle<()>>,
}

impl Incarnation {
    /// Close the proxy and stop its receive task.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        if let Some(proxy) = &self.proxy {
            proxy.close();
        }
    }
}

/// Point-in-time view of one account, published as `system_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub state: ProcessState,
    pub desired_enabled: bool,
    pub restart_count: u32,
    pub generation: u64,
    pub pid: Option<u32>,
    pub connected: bool,
    pub last_heartbeat_age_ms: Option<u64>,
    pub next_restart_backoff_ms: u64,
    pub state_since: DateTime<Utc>,
}

/// All account records, keyed by account id.
#[derive(Default)]
pub struct Registry {
    records: HashMap<String, AccountRuntimeRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build records for every enabled account.
    pub fn from_accounts<'a>(accounts: impl IntoIterator<Item = &'a AccountConfig>) -> Self {
        let mut registry = Self::new();
        for account in accounts.into_iter().filter(|a| a.enabled) {
            registry.insert(AccountRuntimeRecord::new(account.clone()));
        }
        registry
    }

    pub fn insert(&mut self, record: AccountRuntimeRecord) {
        self.records.insert(record.account_id.clone(), record);
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountRuntimeRecord> {
        self.records.get(account_id)
    }

    pub fn get_mut(&mut self, account_id: &str) -> Option<&mut AccountRuntimeRecord> {
        self.records.get_mut(account_id)
    }

    pub fn remove(&mut self, account_id: &str) -> Option<AccountRuntimeRecord> {
        self.records.remove(account_id)
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.records.contains_key(account_id)
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountRuntimeRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshots sorted by account id.
    pub fn statuses(&self, now: Instant) -> Vec<AccountStatus> {
        let mut statuses: Vec<AccountStatus> = self.iter().map(|r| r.status(now)).collect();
        statuses.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use ProcessState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Running));
        assert!(Restarting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Restarting));
    }

    #[tokio::test]
    async fn test_transition_tracks_running_and_degraded_times() {
        let mut record = AccountRuntimeRecord::new(AccountConfig::new("acc1"));
        assert!(record.transition(ProcessState::Starting));
        assert!(record.transition(ProcessState::Running));
        assert!(record.running_since.is_some());

        assert!(record.transition(ProcessState::Degraded));
        assert!(record.degraded_since.is_some());
        assert!(record.running_since.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_refused() {
        let mut record = AccountRuntimeRecord::new(AccountConfig::new("acc1"));
        assert!(!record.transition(ProcessState::Running));
        assert_eq!(record.state, ProcessState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_clock_age() {
        let clock = HeartbeatClock::new();
        assert!(clock.age(Instant::now()).is_none());

        clock.touch();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(clock.age(Instant::now()), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_registry_only_holds_enabled_accounts() {
        let mut disabled = AccountConfig::new("acc2");
        disabled.enabled = false;
        let accounts = vec![AccountConfig::new("acc1"), disabled];

        let registry = Registry::from_accounts(&accounts);
        assert_eq!(registry.account_ids(), vec!["acc1".to_string()]);

        let statuses = registry.statuses(Instant::now());
        assert_eq!(statuses[0].state, ProcessState::Stopped);
        assert!(!statuses[0].connected);
    }
}
