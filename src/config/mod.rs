//! Configuration management for the control plane.
//!
//! Loads settings from an optional `config` file and `QTRADER__*`
//! environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local socket transport settings
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Process lifecycle supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Telemetry cache and fan-out
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Managed brokerage accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Directory holding one socket per account
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,
    /// Seconds a caller waits for a response before `RequestTimeout`
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds between heartbeats sent by execution processes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Envelopes queued per channel before `send` waits
    #[serde(default = "default_send_capacity")]
    pub send_capacity: usize,
    /// Connection attempts made after spawning an execution process
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between health-check ticks
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Silence longer than this marks a running account DEGRADED
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds a DEGRADED account may recover before it is restarted
    #[serde(default = "default_degraded_grace")]
    pub degraded_grace_secs: u64,
    /// Seconds a STARTING account has to register
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Seconds to wait after a graceful stop request before killing
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// First restart delay in milliseconds, doubled per consecutive restart
    #[serde(default = "default_restart_backoff_base")]
    pub restart_backoff_base_ms: u64,
    /// Restart delay ceiling in seconds
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max_secs: u64,
    /// Consecutive restarts allowed before the account is marked FAILED
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Seconds of uninterrupted RUNNING that reset the restart count
    #[serde(default = "default_stable_period")]
    pub stable_period_secs: u64,
    /// Execution binary; defaults to the current executable
    #[serde(default)]
    pub trader_binary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Flush interval for batched singleton kinds (account, system_status)
    #[serde(default = "default_account_flush_interval")]
    pub account_flush_interval_ms: u64,
    /// Recent trades kept per account for replay to new subscribers
    #[serde(default = "default_trade_window")]
    pub trade_window: usize,
    /// Recent alarms kept per account for replay to new subscribers
    #[serde(default = "default_alarm_window")]
    pub alarm_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    /// Only enabled accounts get a registry record and a process
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub risk: RiskLimitsConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

/// Paper gateway settings for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Starting cash balance
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Milliseconds between simulated ticks (0 disables the feed)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// First simulated price for every symbol
    #[serde(default = "default_base_price")]
    pub base_price: Decimal,
    /// Simulated price step per tick
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
    /// Seconds between account snapshots pushed to the control process
    #[serde(default = "default_account_push_interval")]
    pub account_push_interval_secs: u64,
}

/// Per-account order limits checked before every submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    #[serde(default = "default_max_daily_orders")]
    pub max_daily_orders: u32,
    #[serde(default = "default_max_daily_cancels")]
    pub max_daily_cancels: u32,
    #[serde(default = "default_max_order_volume")]
    pub max_order_volume: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    /// Strategy implementation, currently `rsi`
    #[serde(rename = "type", default = "default_strategy_type")]
    pub strategy_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub symbol: String,
    /// Contracts per order
    #[serde(default = "default_strategy_volume")]
    pub volume: u32,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// Buy when RSI falls below this level
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: Decimal,
    /// Sell when RSI rises above this level
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: Decimal,
}

// Default value functions
fn default_socket_dir() -> String {
    "./data/socks".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_send_capacity() -> usize {
    256
}

fn default_connect_attempts() -> u32 {
    50
}

fn default_connect_retry_delay() -> u64 {
    200
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_degraded_grace() -> u64 {
    10 // one health-check cycle
}

fn default_start_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_restart_backoff_base() -> u64 {
    1000
}

fn default_restart_backoff_max() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    5
}

fn default_stable_period() -> u64 {
    300 // 5 minutes
}

fn default_account_flush_interval() -> u64 {
    3000
}

fn default_trade_window() -> usize {
    200
}

fn default_alarm_window() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_initial_balance() -> Decimal {
    Decimal::new(1_000_000, 0)
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_base_price() -> Decimal {
    Decimal::new(3500, 0)
}

fn default_price_tick() -> Decimal {
    Decimal::ONE
}

fn default_account_push_interval() -> u64 {
    1
}

fn default_max_daily_orders() -> u32 {
    1000
}

fn default_max_daily_cancels() -> u32 {
    500
}

fn default_max_order_volume() -> u32 {
    50
}

fn default_strategy_type() -> String {
    "rsi".to_string()
}

fn default_strategy_volume() -> u32 {
    1
}

fn default_rsi_period() -> usize {
    14
}

fn default_rsi_oversold() -> Decimal {
    Decimal::new(30, 0)
}

fn default_rsi_overbought() -> Decimal {
    Decimal::new(70, 0)
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load from a named config file (extension optional) plus environment.
    pub fn load_from(name: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("QTRADER"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.supervisor.health_check_interval_secs > 0,
            "health_check_interval_secs must be positive"
        );

        anyhow::ensure!(
            self.supervisor.heartbeat_timeout_secs >= self.ipc.heartbeat_interval_secs,
            "heartbeat_timeout_secs must be >= heartbeat_interval_secs"
        );

        anyhow::ensure!(
            self.supervisor.restart_backoff_base_ms > 0
                && self.supervisor.restart_backoff_base_ms
                    <= self.supervisor.restart_backoff_max_secs * 1000,
            "restart_backoff_base_ms must be positive and <= restart_backoff_max_secs"
        );

        anyhow::ensure!(
            self.aggregator.account_flush_interval_ms > 0,
            "account_flush_interval_ms must be positive"
        );

        anyhow::ensure!(self.ipc.send_capacity > 0, "send_capacity must be positive");

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            anyhow::ensure!(
                !account.account_id.is_empty()
                    && account
                        .account_id
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "account_id '{}' must be non-empty and use [A-Za-z0-9_-]",
                account.account_id
            );
            anyhow::ensure!(
                seen.insert(account.account_id.as_str()),
                "duplicate account_id '{}'",
                account.account_id
            );
            account.validate()?;
        }

        Ok(())
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }

    /// Socket path for one account.
    pub fn socket_path(&self, account_id: &str) -> PathBuf {
        Path::new(&self.ipc.socket_dir).join(crate::ipc::socket_file_name(account_id))
    }
}

impl AccountConfig {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            enabled: true,
            gateway: GatewayConfig::default(),
            risk: RiskLimitsConfig::default(),
            strategies: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.risk.max_order_volume > 0,
            "[{}] max_order_volume must be positive",
            self.account_id
        );

        let mut ids = std::collections::HashSet::new();
        for strategy in &self.strategies {
            anyhow::ensure!(
                ids.insert(strategy.strategy_id.as_str()),
                "[{}] duplicate strategy_id '{}'",
                self.account_id,
                strategy.strategy_id
            );
            anyhow::ensure!(
                strategy.rsi_period > 1,
                "[{}] strategy '{}': rsi_period must be > 1",
                self.account_id,
                strategy.strategy_id
            );
            anyhow::ensure!(
                strategy.rsi_oversold < strategy.rsi_overbought,
                "[{}] strategy '{}': rsi_oversold must be < rsi_overbought",
                self.account_id,
                strategy.strategy_id
            );
        }

        Ok(())
    }
}

impl IpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

impl SupervisorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn degraded_grace(&self) -> Duration {
        Duration::from_secs(self.degraded_grace_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stable_period(&self) -> Duration {
        Duration::from_secs(self.stable_period_secs)
    }

    /// Delay before the `restart_count`-th consecutive restart.
    ///
    /// `base * 2^(restart_count - 1)`, capped at the configured maximum.
    pub fn restart_backoff(&self, restart_count: u32) -> Duration {
        let max = Duration::from_secs(self.restart_backoff_max_secs);
        let exponent = restart_count.saturating_sub(1).min(20);
        let delay = Duration::from_millis(
            self.restart_backoff_base_ms
                .saturating_mul(1u64 << exponent),
        );
        delay.min(max)
    }
}

impl AggregatorConfig {
    pub fn account_flush_interval(&self) -> Duration {
        Duration::from_millis(self.account_flush_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipc: IpcConfig::default(),
            supervisor: SupervisorConfig::default(),
            aggregator: AggregatorConfig::default(),
            accounts: Vec::new(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            send_capacity: default_send_capacity(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            degraded_grace_secs: default_degraded_grace(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            restart_backoff_base_ms: default_restart_backoff_base(),
            restart_backoff_max_secs: default_restart_backoff_max(),
            max_restarts: default_max_restarts(),
            stable_period_secs: default_stable_period(),
            trader_binary: None,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            account_flush_interval_ms: default_account_flush_interval(),
            trade_window: default_trade_window(),
            alarm_window: default_alarm_window(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            tick_interval_ms: default_tick_interval(),
            base_price: default_base_price(),
            price_tick: default_price_tick(),
            account_push_interval_secs: default_account_push_interval(),
        }
    }
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_daily_orders: default_max_daily_orders(),
            max_daily_cancels: default_max_daily_cancels(),
            max_order_volume: default_max_order_volume(),
        }
    }
}
