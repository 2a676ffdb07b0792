//! Execution process supervision.
//!
//! A single task owns the registry. Commands arrive through
//! [`SupervisorHandle`], connection events through an internal queue, and a
//! periodic health tick drives the lifecycle:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING <-> DEGRADED -> RESTARTING -> RUNNING | FAILED
//! ```
//!
//! Every spawn bumps the account's generation so events from an earlier
//! incarnation are recognised and ignored.

use super::aggregator::AggregatorHandle;
use super::launcher::{LaunchSpec, ProcessHandle, ProcessLauncher, Transport};
use super::proxy::ExecutionProxy;
use super::registry::{AccountRuntimeRecord, AccountStatus, Incarnation, ProcessState, Registry};
use crate::config::{AccountConfig, Config};
use crate::error::{ControlError, IpcError};
use crate::ipc::{Channel, ControlRequest, Envelope, MessageType, RegisterInfo};
use crate::models::{AlarmData, AlarmSeverity, AlarmSource};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Notifications from connection tasks and proxies.
#[derive(Debug)]
pub enum SupervisorEvent {
    Connected {
        account_id: String,
        generation: u64,
        proxy: ExecutionProxy,
    },
    ConnectFailed {
        account_id: String,
        generation: u64,
        reason: String,
    },
    Registered {
        account_id: String,
        generation: u64,
        info: RegisterInfo,
    },
    ChannelLost {
        account_id: String,
        generation: u64,
        reason: String,
    },
    RestartDue {
        account_id: String,
        generation: u64,
    },
}

type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

enum Command {
    Start {
        account_id: String,
        reply: Reply<()>,
    },
    Stop {
        account_id: String,
        reply: Reply<()>,
    },
    Reset {
        account_id: String,
        reply: Reply<()>,
    },
    Enable {
        config: AccountConfig,
        reply: Reply<()>,
    },
    Disable {
        account_id: String,
        reply: Reply<()>,
    },
    Status {
        account_id: String,
        reply: Reply<AccountStatus>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<AccountStatus>>,
    },
    Proxy {
        account_id: String,
        reply: Reply<ExecutionProxy>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle for issuing supervisor commands.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ControlError::SupervisorGone)?;
        rx.await.map_err(|_| ControlError::SupervisorGone)?
    }

    /// STOPPED -> STARTING. A no-op for accounts already live.
    pub async fn start(&self, account_id: &str) -> Result<(), ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Start { account_id, reply }).await
    }

    /// Graceful stop request, bounded wait, then force termination.
    pub async fn stop(&self, account_id: &str) -> Result<(), ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Stop { account_id, reply }).await
    }

    pub async fn restart(&self, account_id: &str) -> Result<(), ControlError> {
        self.stop(account_id).await?;
        self.start(account_id).await
    }

    /// Clear a FAILED account and start it again if it is enabled.
    pub async fn reset(&self, account_id: &str) -> Result<(), ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Reset { account_id, reply }).await
    }

    /// Add (or re-enable) an account and start it.
    pub async fn enable_account(&self, config: AccountConfig) -> Result<(), ControlError> {
        self.call(|reply| Command::Enable { config, reply }).await
    }

    /// Stop an account and drop its record.
    pub async fn disable_account(&self, account_id: &str) -> Result<(), ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Disable { account_id, reply })
            .await
    }

    pub async fn status(&self, account_id: &str) -> Result<AccountStatus, ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Status { account_id, reply })
            .await
    }

    pub async fn statuses(&self) -> Result<Vec<AccountStatus>, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Statuses { reply })
            .await
            .map_err(|_| ControlError::SupervisorGone)?;
        rx.await.map_err(|_| ControlError::SupervisorGone)
    }

    /// Proxy of the account's live connection.
    pub async fn proxy(&self, account_id: &str) -> Result<ExecutionProxy, ControlError> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Proxy { account_id, reply }).await
    }

    /// Send a request to one account's execution process.
    ///
    /// Without an open channel this fails at once with `ChannelClosed`.
    pub async fn send_request(
        &self,
        account_id: &str,
        request: &ControlRequest,
    ) -> Result<Value, ControlError> {
        let proxy = self.proxy(account_id).await?;
        Ok(proxy.send_request(request).await?)
    }

    /// Stop every account and end the supervisor task.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| ControlError::SupervisorGone)?;
        rx.await.map_err(|_| ControlError::SupervisorGone)
    }
}

/// Supervisor task state.
pub struct Supervisor {
    config: Arc<Config>,
    config_path: Option<String>,
    registry: Registry,
    launcher: Arc<dyn ProcessLauncher>,
    transport: Arc<dyn Transport>,
    aggregator: AggregatorHandle,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        launcher: Arc<dyn ProcessLauncher>,
        transport: Arc<dyn Transport>,
        aggregator: AggregatorHandle,
    ) -> (Self, SupervisorHandle) {
        let (tx, commands) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Registry::from_accounts(&config.accounts);
        let supervisor = Self {
            config,
            config_path: None,
            registry,
            launcher,
            transport,
            aggregator,
            commands,
            events_tx,
            events_rx,
        };
        (supervisor, SupervisorHandle { tx })
    }

    /// Config file handed to spawned execution processes.
    pub fn with_config_path(mut self, path: Option<String>) -> Self {
        self.config_path = path;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Start enabled accounts, then serve commands, events and health ticks.
    pub async fn run(mut self) {
        let period = self.config.supervisor.health_check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            accounts = self.registry.len(),
            ?period,
            "Supervisor started"
        );
        for account_id in self.registry.account_ids() {
            let enabled = self
                .registry
                .get(&account_id)
                .is_some_and(|r| r.desired_enabled);
            if enabled {
                if let Err(e) = self.start_account(&account_id) {
                    error!(%account_id, error = %e, "Initial start failed");
                }
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown_all().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.health_check(),
            }
        }

        info!("Supervisor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { account_id, reply } => {
                let _ = reply.send(self.start_account(&account_id));
            }
            Command::Stop { account_id, reply } => match self.stop_account(&account_id) {
                Ok(job) => {
                    tokio::spawn(async move {
                        job.run().await;
                        let _ = reply.send(Ok(()));
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Reset { account_id, reply } => {
                let _ = reply.send(self.reset_account(&account_id));
            }
            Command::Enable { config, reply } => {
                let _ = reply.send(self.enable_account(config));
            }
            Command::Disable { account_id, reply } => match self.stop_account(&account_id) {
                Ok(job) => {
                    self.registry.remove(&account_id);
                    info!(%account_id, "Account disabled");
                    let aggregator = self.aggregator.clone();
                    tokio::spawn(async move {
                        job.run().await;
                        // After teardown so late pushes of the old process are cleared too.
                        aggregator.forget_account(&account_id);
                        let _ = reply.send(Ok(()));
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Status { account_id, reply } => {
                let status = self
                    .registry
                    .get(&account_id)
                    .map(|r| r.status(Instant::now()))
                    .ok_or(ControlError::UnknownAccount(account_id));
                let _ = reply.send(status);
            }
            Command::Statuses { reply } => {
                let _ = reply.send(self.registry.statuses(Instant::now()));
            }
            Command::Proxy { account_id, reply } => {
                let proxy = match self.registry.get(&account_id) {
                    None => Err(ControlError::UnknownAccount(account_id)),
                    Some(record) => record
                        .proxy
                        .clone()
                        .filter(|p| !p.is_closed())
                        .ok_or(ControlError::Ipc(IpcError::ChannelClosed)),
                };
                let _ = reply.send(proxy);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start_account(&mut self, account_id: &str) -> Result<(), ControlError> {
        let record = self
            .registry
            .get_mut(account_id)
            .ok_or_else(|| ControlError::UnknownAccount(account_id.to_string()))?;

        match record.state {
            ProcessState::Stopped => {
                record.desired_enabled = true;
                record.transition(ProcessState::Starting);
                self.publish_status(account_id);
                self.spawn_incarnation(account_id);
                Ok(())
            }
            ProcessState::Failed => Err(ControlError::InvalidState {
                account_id: account_id.to_string(),
                action: "start",
                state: record.state.to_string(),
            }),
            _ => {
                debug!(%account_id, state = %record.state, "Start ignored, already live");
                Ok(())
            }
        }
    }

    /// Detach the current incarnation and move to STOPPED. The returned job
    /// finishes the teardown outside the supervisor task.
    fn stop_account(&mut self, account_id: &str) -> Result<StopJob, ControlError> {
        let timeout = self.config.supervisor.stop_timeout();
        let record = self
            .registry
            .get_mut(account_id)
            .ok_or_else(|| ControlError::UnknownAccount(account_id.to_string()))?;

        let incarnation = record.detach_incarnation();
        record.restart_due_at = None;
        if record.state != ProcessState::Stopped {
            record.transition(ProcessState::Stopped);
        }
        self.publish_status(account_id);

        Ok(StopJob {
            account_id: account_id.to_string(),
            incarnation,
            timeout,
        })
    }

    fn reset_account(&mut self, account_id: &str) -> Result<(), ControlError> {
        let record = self
            .registry
            .get_mut(account_id)
            .ok_or_else(|| ControlError::UnknownAccount(account_id.to_string()))?;

        match record.state {
            ProcessState::Failed | ProcessState::Stopped => {
                if record.state == ProcessState::Failed {
                    record.transition(ProcessState::Stopped);
                }
                record.restart_count = 0;
                record.next_restart_backoff = Duration::ZERO;
                let enabled = record.desired_enabled;
                info!(%account_id, "Account reset");
                self.publish_status(account_id);
                if enabled {
                    self.start_account(account_id)?;
                }
                Ok(())
            }
            state => Err(ControlError::InvalidState {
                account_id: account_id.to_string(),
                action: "reset",
                state: state.to_string(),
            }),
        }
    }

    fn enable_account(&mut self, config: AccountConfig) -> Result<(), ControlError> {
        let account_id = config.account_id.clone();
        match self.registry.get_mut(&account_id) {
            Some(record) => {
                record.config = config;
                record.desired_enabled = true;
            }
            None => {
                let mut record = AccountRuntimeRecord::new(config);
                record.desired_enabled = true;
                self.registry.insert(record);
                info!(%account_id, "Account enabled");
            }
        }
        self.start_account(&account_id)
    }

    /// Launch a process and start connecting to it in the background.
    fn spawn_incarnation(&mut self, account_id: &str) {
        let socket_path = self.socket_path(account_id);
        let spec = LaunchSpec {
            account_id: account_id.to_string(),
            socket_path: socket_path.clone(),
            config_path: self.config_path.clone(),
        };
        let launched = self.launcher.launch(&spec);

        let Some(record) = self.registry.get_mut(account_id) else {
            return;
        };
        record.generation += 1;
        record.restart_due_at = None;
        record.heartbeat = Default::default();
        let generation = record.generation;

        let process = match launched {
            Ok(process) => process,
            Err(e) => {
                error!(%account_id, error = %e, "Failed to launch execution process");
                self.schedule_restart(account_id, "spawn failed");
                return;
            }
        };
        record.pid = process.pid();
        record.process = Some(process);
        record.spawned_at = Some(Instant::now());

        let task = tokio::spawn(connect_and_serve(ConnectTask {
            account_id: account_id.to_string(),
            generation,
            socket_path,
            transport: self.transport.clone(),
            attempts: self.config.ipc.connect_attempts.max(1),
            retry_delay: self.config.ipc.connect_retry_delay(),
            send_capacity: self.config.ipc.send_capacity,
            request_timeout: self.config.ipc.request_timeout(),
            heartbeat: record.heartbeat.clone(),
            events: self.events_tx.clone(),
            aggregator: self.aggregator.clone(),
        }));
        record.io_task = Some(task);

        debug!(%account_id, generation, "Incarnation spawned");
    }

    /// RESTARTING path: kill what is left, count the failure, then either
    /// schedule a respawn after backoff or give up with FAILED.
    fn schedule_restart(&mut self, account_id: &str, reason: &str) {
        let max_restarts = self.config.supervisor.max_restarts;
        let Some(record) = self.registry.get_mut(account_id) else {
            return;
        };

        let incarnation = record.take_incarnation();
        if let Some(mut process) = incarnation.process {
            tokio::spawn(async move { process.kill().await });
        }

        record.restart_count += 1;
        let restart_count = record.restart_count;

        if restart_count > max_restarts {
            // FAILED is only reachable through RESTARTING.
            if record.state != ProcessState::Restarting {
                record.transition(ProcessState::Restarting);
            }
            record.transition(ProcessState::Failed);
            error!(
                %account_id,
                restart_count,
                max_restarts,
                reason,
                "Restart ceiling exceeded, account FAILED"
            );
            self.publish_status(account_id);
            self.publish_alarm(
                account_id,
                AlarmSeverity::Critical,
                "Execution process failed",
                format!("{} restarts exceeded the ceiling of {} ({})", restart_count, max_restarts, reason),
            );
            return;
        }

        let backoff = self.config.supervisor.restart_backoff(restart_count);
        record.next_restart_backoff = backoff;
        record.restart_due_at = Some(Instant::now() + backoff);
        record.transition(ProcessState::Restarting);
        let generation = record.generation;

        warn!(
            %account_id,
            restart_count,
            ?backoff,
            reason,
            "Restarting execution process"
        );
        self.publish_status(account_id);

        let events = self.events_tx.clone();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.send(SupervisorEvent::RestartDue {
                account_id,
                generation,
            });
        });
    }

    fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Connected {
                account_id,
                generation,
                proxy,
            } => {
                let Some(record) = self.current(&account_id, generation) else {
                    proxy.close();
                    return;
                };
                if !record.state.is_live() {
                    proxy.close();
                    return;
                }
                // One open channel per account.
                if let Some(old) = record.proxy.replace(proxy) {
                    old.close();
                }
                info!(%account_id, generation, "Connected to execution process");
                self.publish_status(&account_id);
            }
            SupervisorEvent::ConnectFailed {
                account_id,
                generation,
                reason,
            } => {
                let Some(record) = self.current(&account_id, generation) else {
                    return;
                };
                if matches!(
                    record.state,
                    ProcessState::Starting | ProcessState::Restarting
                ) {
                    warn!(%account_id, generation, %reason, "Could not connect to execution process");
                    if record.state == ProcessState::Starting {
                        record.transition(ProcessState::Restarting);
                    }
                    self.schedule_restart(&account_id, "connect failed");
                }
            }
            SupervisorEvent::Registered {
                account_id,
                generation,
                info,
            } => {
                let Some(record) = self.current(&account_id, generation) else {
                    return;
                };
                record.pid = Some(info.pid);
                match record.state {
                    ProcessState::Starting | ProcessState::Restarting | ProcessState::Degraded => {
                        record.transition(ProcessState::Running);
                        info!(
                            %account_id,
                            generation,
                            pid = info.pid,
                            version = %info.version,
                            "Execution process registered"
                        );
                        self.publish_status(&account_id);
                    }
                    state => {
                        debug!(%account_id, %state, "Registration ignored");
                    }
                }
            }
            SupervisorEvent::ChannelLost {
                account_id,
                generation,
                reason,
            } => {
                let Some(record) = self.current(&account_id, generation) else {
                    return;
                };
                record.proxy = None;
                if record.state == ProcessState::Running {
                    warn!(%account_id, generation, %reason, "Channel lost while running");
                    record.transition(ProcessState::Degraded);
                    self.publish_status(&account_id);
                }
            }
            SupervisorEvent::RestartDue {
                account_id,
                generation,
            } => {
                let Some(record) = self.current(&account_id, generation) else {
                    return;
                };
                if record.state == ProcessState::Restarting && record.restart_due_at.is_some() {
                    self.spawn_incarnation(&account_id);
                }
            }
        }
    }

    /// Record for `account_id` if `generation` is still its current one.
    fn current(&mut self, account_id: &str, generation: u64) -> Option<&mut AccountRuntimeRecord> {
        match self.registry.get_mut(account_id) {
            Some(record) if record.generation == generation => Some(record),
            Some(record) => {
                debug!(
                    %account_id,
                    stale = generation,
                    current = record.generation,
                    "Ignoring event from previous incarnation"
                );
                None
            }
            None => None,
        }
    }

    /// Periodic liveness evaluation for every account.
    fn health_check(&mut self) {
        let now = Instant::now();
        let timeout = self.config.supervisor.heartbeat_timeout();
        let grace = self.config.supervisor.degraded_grace();
        let start_timeout = self.config.supervisor.start_timeout();
        let stable_period = self.config.supervisor.stable_period();

        for account_id in self.registry.account_ids() {
            let Some(record) = self.registry.get_mut(&account_id) else {
                continue;
            };
            let age = record.heartbeat.age(now);
            let silent = age.map_or(true, |age| age > timeout);

            match record.state {
                ProcessState::Running => {
                    let mut changed = false;
                    if record.restart_count > 0
                        && record
                            .running_since
                            .is_some_and(|since| now.saturating_duration_since(since) >= stable_period)
                    {
                        info!(
                            %account_id,
                            restart_count = record.restart_count,
                            "Stable run, restart count reset"
                        );
                        record.restart_count = 0;
                        record.next_restart_backoff = Duration::ZERO;
                        changed = true;
                    }
                    if silent {
                        warn!(%account_id, ?age, ?timeout, "Heartbeat overdue");
                        record.transition(ProcessState::Degraded);
                        changed = true;
                    }
                    if changed {
                        self.publish_status(&account_id);
                    }
                }
                ProcessState::Degraded => {
                    let exited = record.process.as_mut().map_or(true, |p| p.has_exited());
                    let connected = record.proxy.as_ref().is_some_and(|p| !p.is_closed());
                    let grace_over = record
                        .degraded_since
                        .map_or(true, |since| now.saturating_duration_since(since) >= grace);

                    if !exited && connected && !silent {
                        info!(%account_id, "Heartbeat resumed");
                        record.transition(ProcessState::Running);
                        self.publish_status(&account_id);
                    } else if exited || grace_over {
                        let reason = if exited { "process exited" } else { "heartbeat timeout" };
                        record.transition(ProcessState::Restarting);
                        self.schedule_restart(&account_id, reason);
                    }
                }
                ProcessState::Starting | ProcessState::Restarting
                    if record.restart_due_at.is_none() =>
                {
                    let exited = record.process.as_mut().is_some_and(|p| p.has_exited());
                    let overdue = record
                        .spawned_at
                        .map_or(true, |at| now.saturating_duration_since(at) > start_timeout);
                    if exited || overdue {
                        let reason = if exited {
                            "exited before registering"
                        } else {
                            "registration timeout"
                        };
                        if record.state == ProcessState::Starting {
                            record.transition(ProcessState::Restarting);
                        }
                        self.schedule_restart(&account_id, reason);
                    }
                }
                _ => {}
            }
        }
    }

    async fn shutdown_all(&mut self) {
        info!("Stopping all execution processes");
        let mut stopping = Vec::new();
        for account_id in self.registry.account_ids() {
            if let Ok(job) = self.stop_account(&account_id) {
                stopping.push(tokio::spawn(job.run()));
            }
        }
        for task in stopping {
            let _ = task.await;
        }
    }

    fn socket_path(&self, account_id: &str) -> PathBuf {
        self.config.socket_path(account_id)
    }

    fn publish_status(&self, account_id: &str) {
        let Some(record) = self.registry.get(account_id) else {
            return;
        };
        match Envelope::with_payload(
            MessageType::SystemStatus,
            account_id,
            &record.status(Instant::now()),
        ) {
            Ok(envelope) => self.aggregator.ingest(account_id, envelope),
            Err(e) => warn!(%account_id, error = %e, "Failed to encode status"),
        }
    }

    fn publish_alarm(
        &self,
        account_id: &str,
        severity: AlarmSeverity,
        title: &str,
        detail: String,
    ) {
        let alarm = AlarmData::new(account_id, AlarmSource::Manager, severity, title)
            .with_detail(detail);
        match Envelope::with_payload(MessageType::Alarm, account_id, &alarm) {
            Ok(envelope) => self.aggregator.ingest(account_id, envelope),
            Err(e) => warn!(%account_id, error = %e, "Failed to encode alarm"),
        }
    }
}

/// Teardown of one stopped incarnation: stop request, bounded wait, kill.
struct StopJob {
    account_id: String,
    incarnation: Incarnation,
    timeout: Duration,
}

impl StopJob {
    async fn run(mut self) {
        let account_id = self.account_id;
        if let Some(proxy) = &self.incarnation.proxy {
            match proxy
                .send_request_with_timeout(&ControlRequest::Stop, self.timeout)
                .await
            {
                Ok(_) => debug!(%account_id, "Stop request acknowledged"),
                Err(e) => debug!(%account_id, error = %e, "Stop request not acknowledged"),
            }
        }
        self.incarnation.disconnect();

        if let Some(mut process) = self.incarnation.process.take() {
            stop_process(&account_id, process.as_mut(), self.timeout).await;
        }
        info!(%account_id, "Execution process stopped");
    }
}

async fn stop_process(account_id: &str, process: &mut dyn ProcessHandle, timeout: Duration) {
    if process.wait_exit(timeout).await {
        return;
    }
    warn!(%account_id, ?timeout, "Process ignored stop request, killing");
    process.kill().await;
}

struct ConnectTask {
    account_id: String,
    generation: u64,
    socket_path: PathBuf,
    transport: Arc<dyn Transport>,
    attempts: u32,
    retry_delay: Duration,
    send_capacity: usize,
    request_timeout: Duration,
    heartbeat: super::registry::HeartbeatClock,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    aggregator: AggregatorHandle,
}

/// Connect with retries, hand the proxy to the supervisor, then run its
/// receive loop until the channel ends.
async fn connect_and_serve(task: ConnectTask) {
    let mut last_error = String::new();
    for attempt in 1..=task.attempts {
        match task.transport.connect(&task.socket_path).await {
            Ok(stream) => {
                let (sender, receiver) =
                    Channel::with_capacity(stream, task.send_capacity).split();
                let proxy = ExecutionProxy::supervised(
                    &task.account_id,
                    task.generation,
                    sender,
                    task.heartbeat.clone(),
                    task.request_timeout,
                    task.events.clone(),
                );
                let aggregator = task.aggregator.clone();
                proxy.on_push(Arc::new(move |account_id: &str, envelope: &Envelope| {
                    aggregator.ingest(account_id, envelope.clone());
                }));

                debug!(account_id = %task.account_id, attempt, "Socket connected");
                let _ = task.events.send(SupervisorEvent::Connected {
                    account_id: task.account_id.clone(),
                    generation: task.generation,
                    proxy: proxy.clone(),
                });
                proxy.run(receiver).await;
                return;
            }
            Err(e) => {
                last_error = e.to_string();
                debug!(
                    account_id = %task.account_id,
                    attempt,
                    error = %e,
                    "Socket not ready"
                );
                tokio::time::sleep(task.retry_delay).await;
            }
        }
    }

    let _ = task.events.send(SupervisorEvent::ConnectFailed {
        account_id: task.account_id,
        generation: task.generation,
        reason: last_error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::aggregator::{Aggregator, SubscriptionFilter, TelemetryKind};
    use crate::control::launcher::testing::{FakeWorld, Launched};
    use crate::ipc::{HeartbeatInfo, ResponseBody};
    use chrono::Utc;
    use tokio::sync::watch;

    /// Scripted execution process on the far end of a fake socket.
    struct FakeTrader {
        stop_heartbeats: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    impl FakeTrader {
        /// Register, then heartbeat every 5 s and answer every request.
        fn start(launched: Launched) -> Self {
            let (stop_tx, mut stop_rx) = watch::channel(false);
            let account_id = launched.spec.account_id.clone();
            let state = launched.state.clone();
            let task = tokio::spawn(async move {
                let (sender, mut receiver) = Channel::new(launched.stream).split();
                let info = RegisterInfo {
                    pid: 1,
                    started_at: Utc::now(),
                    version: "test".into(),
                };
                let _ = sender
                    .send(Envelope::with_payload(MessageType::Register, &account_id, &info).unwrap())
                    .await;

                let hb_sender = sender.clone();
                let hb_account = account_id.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(5));
                    loop {
                        ticker.tick().await;
                        if *stop_rx.borrow_and_update() {
                            break;
                        }
                        let hb = HeartbeatInfo { sent_at: Utc::now() };
                        let envelope =
                            Envelope::with_payload(MessageType::Heartbeat, &hb_account, &hb).unwrap();
                        if hb_sender.send(envelope).await.is_err() {
                            break;
                        }
                    }
                });

                while let Ok(request) = receiver.receive().await {
                    let Some(request_id) = request.request_id.clone() else {
                        continue;
                    };
                    let response = ResponseBody::success(Value::Null)
                        .to_envelope(&account_id, &request_id)
                        .unwrap();
                    let _ = sender.send(response).await;
                    if request.msg_type == "stop_req" {
                        *state.exited.lock().unwrap() = true;
                        break;
                    }
                }
            });
            Self {
                stop_heartbeats: stop_tx,
                task,
            }
        }

        fn go_silent(&self) {
            let _ = self.stop_heartbeats.send(true);
        }
    }

    fn test_config(max_restarts: u32) -> Config {
        let mut config = Config::default();
        config.supervisor.health_check_interval_secs = 10;
        config.supervisor.heartbeat_timeout_secs = 30;
        config.supervisor.degraded_grace_secs = 10;
        config.supervisor.restart_backoff_base_ms = 1000;
        config.supervisor.restart_backoff_max_secs = 8;
        config.supervisor.max_restarts = max_restarts;
        config.supervisor.stable_period_secs = 120;
        config.ipc.connect_attempts = 3;
        config.ipc.connect_retry_delay_ms = 100;
        config.accounts.push(AccountConfig::new("acc1"));
        config
    }

    struct Setup {
        handle: SupervisorHandle,
        world: Arc<FakeWorld>,
        launches: mpsc::UnboundedReceiver<Launched>,
        aggregator: AggregatorHandle,
    }

    fn setup(config: Config) -> Setup {
        let (aggregator, _) = Aggregator::spawn(config.aggregator.clone());
        let (world, launches) = FakeWorld::new();
        let (supervisor, handle) = Supervisor::new(
            Arc::new(config),
            world.clone(),
            world.clone(),
            aggregator.clone(),
        );
        supervisor.spawn();
        Setup {
            handle,
            world,
            launches,
            aggregator,
        }
    }

    async fn wait_for_state(handle: &SupervisorHandle, state: ProcessState) -> AccountStatus {
        for _ in 0..2000 {
            let status = handle.status("acc1").await.unwrap();
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("account never reached {state}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_and_runs() {
        let mut s = setup(test_config(3));
        let launched = s.launches.recv().await.unwrap();
        assert_eq!(launched.spec.account_id, "acc1");
        assert!(launched.spec.socket_path.ends_with("qtrader_acc1.sock"));
        let _trader = FakeTrader::start(launched);

        let status = wait_for_state(&s.handle, ProcessState::Running).await;
        assert!(status.connected);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.generation, 1);

        let reply = s
            .handle
            .send_request("acc1", &ControlRequest::Status)
            .await
            .unwrap();
        assert_eq!(reply, Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_process_is_restarted_exactly_once() {
        let mut s = setup(test_config(3));
        let first = s.launches.recv().await.unwrap();
        let first_state = first.state.clone();
        let trader = FakeTrader::start(first);
        wait_for_state(&s.handle, ProcessState::Running).await;

        trader.go_silent();
        wait_for_state(&s.handle, ProcessState::Degraded).await;

        let second = s.launches.recv().await.unwrap();
        assert!(*first_state.killed.lock().unwrap());
        let _trader2 = FakeTrader::start(second);

        let status = wait_for_state(&s.handle, ProcessState::Running).await;
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.generation, 2);

        // Healthy again: no further spawns.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(s.launches.try_recv().is_err());
        assert_eq!(s.handle.status("acc1").await.unwrap().restart_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_then_restarting_within_one_extra_cycle() {
        let mut s = setup(test_config(3));
        let trader = FakeTrader::start(s.launches.recv().await.unwrap());
        wait_for_state(&s.handle, ProcessState::Running).await;

        trader.go_silent();
        let silent_at = Instant::now();
        wait_for_state(&s.handle, ProcessState::Degraded).await;
        wait_for_state(&s.handle, ProcessState::Restarting).await;

        let window = Duration::from_secs(30 + 10 + 10 + 5 + 1);
        assert!(silent_at.elapsed() <= window, "took {:?}", silent_at.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_ceiling_marks_failed_and_reset_recovers() {
        let mut s = setup(test_config(2));
        let mut alarms = s
            .aggregator
            .subscribe(SubscriptionFilter::Account("acc1".into()))
            .await
            .unwrap();

        // Processes that never register: each start times out.
        let mut spawned = 0;
        loop {
            tokio::select! {
                launched = s.launches.recv() => {
                    drop(launched);
                    spawned += 1;
                }
                _ = tokio::time::sleep(Duration::from_secs(600)) => break,
            }
        }
        // Initial spawn plus two restarts.
        assert_eq!(spawned, 3);
        let status = s.handle.status("acc1").await.unwrap();
        assert_eq!(status.state, ProcessState::Failed);
        assert_eq!(status.restart_count, 3);

        let mut saw_alarm = false;
        while let Some(update) = alarms.try_recv() {
            saw_alarm |= update.kind == TelemetryKind::Alarm;
        }
        assert!(saw_alarm);

        assert!(matches!(
            s.handle.start("acc1").await,
            Err(ControlError::InvalidState { .. })
        ));

        s.handle.reset("acc1").await.unwrap();
        let _trader = FakeTrader::start(s.launches.recv().await.unwrap());
        let status = wait_for_state(&s.handle, ProcessState::Running).await;
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_count_resets_after_stable_period() {
        let mut s = setup(test_config(3));
        let trader = FakeTrader::start(s.launches.recv().await.unwrap());
        wait_for_state(&s.handle, ProcessState::Running).await;
        trader.go_silent();

        let _trader2 = FakeTrader::start(s.launches.recv().await.unwrap());
        let status = wait_for_state(&s.handle, ProcessState::Running).await;
        assert_eq!(status.restart_count, 1);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(s.handle.status("acc1").await.unwrap().restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_reset_tick_still_detects_silence() {
        let config = test_config(3);
        let (aggregator, _) = Aggregator::spawn(config.aggregator.clone());
        let (world, _launches) = FakeWorld::new();
        let (mut supervisor, _handle) =
            Supervisor::new(Arc::new(config), world.clone(), world, aggregator);

        let record = supervisor.registry.get_mut("acc1").unwrap();
        assert!(record.transition(ProcessState::Starting));
        assert!(record.transition(ProcessState::Running));
        record.restart_count = 2;

        // Past the stable period with no heartbeat ever received.
        tokio::time::advance(Duration::from_secs(150)).await;
        supervisor.health_check();

        let record = supervisor.registry.get("acc1").unwrap();
        assert_eq!(record.restart_count, 0);
        assert_eq!(record.state, ProcessState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sends_stop_request_and_closes_channel() {
        let mut s = setup(test_config(3));
        let launched = s.launches.recv().await.unwrap();
        let state = launched.state.clone();
        let trader = FakeTrader::start(launched);
        wait_for_state(&s.handle, ProcessState::Running).await;

        s.handle.stop("acc1").await.unwrap();
        let status = s.handle.status("acc1").await.unwrap();
        assert_eq!(status.state, ProcessState::Stopped);
        assert!(!status.connected);
        assert!(*state.exited.lock().unwrap());
        assert!(!*state.killed.lock().unwrap(), "graceful stop must not kill");
        let _ = trader.task.await;

        assert!(matches!(
            s.handle.send_request("acc1", &ControlRequest::Status).await,
            Err(ControlError::Ipc(IpcError::ChannelClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_process_is_killed_on_stop() {
        let mut s = setup(test_config(3));
        let launched = s.launches.recv().await.unwrap();
        let state = launched.state.clone();
        // Register but never answer requests.
        let (sender, receiver) = Channel::new(launched.stream).split();
        let info = RegisterInfo {
            pid: 9,
            started_at: Utc::now(),
            version: "test".into(),
        };
        sender
            .send(Envelope::with_payload(MessageType::Register, "acc1", &info).unwrap())
            .await
            .unwrap();
        wait_for_state(&s.handle, ProcessState::Running).await;

        s.handle.stop("acc1").await.unwrap();
        assert!(*state.killed.lock().unwrap());
        drop(receiver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_goes_through_restart_path() {
        let mut config = test_config(1);
        config.accounts.clear();
        let s = setup(config);
        *s.world.fail_spawn.lock().unwrap() = true;

        s.handle
            .enable_account(AccountConfig::new("acc1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = s.handle.status("acc1").await.unwrap();
        assert_eq!(status.state, ProcessState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_account_and_disable() {
        let mut s = setup(test_config(3));
        assert!(matches!(
            s.handle.status("nope").await,
            Err(ControlError::UnknownAccount(_))
        ));

        let _trader = FakeTrader::start(s.launches.recv().await.unwrap());
        wait_for_state(&s.handle, ProcessState::Running).await;
        assert!(!s
            .aggregator
            .read("acc1", TelemetryKind::SystemStatus)
            .await
            .is_empty());
        s.handle.disable_account("acc1").await.unwrap();
        assert!(s.handle.statuses().await.unwrap().is_empty());
        assert!(s
            .aggregator
            .read("acc1", TelemetryKind::SystemStatus)
            .await
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshots_reach_aggregator() {
        let mut s = setup(test_config(3));
        let _trader = FakeTrader::start(s.launches.recv().await.unwrap());
        wait_for_state(&s.handle, ProcessState::Running).await;

        let cached = s.aggregator.read("acc1", TelemetryKind::SystemStatus).await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].data["state"], "RUNNING");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let mut s = setup(test_config(3));
        let _trader = FakeTrader::start(s.launches.recv().await.unwrap());
        wait_for_state(&s.handle, ProcessState::Running).await;

        s.handle.shutdown().await.unwrap();
        assert!(matches!(
            s.handle.statuses().await,
            Err(ControlError::SupervisorGone)
        ));
    }
}
