//! qtrader - Main Entry Point
//!
//! One binary, two roles: the control process (`manager`) supervises one
//! execution process (`trader`) per account over Unix sockets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qtrader::config::Config;
use qtrader::control::{
    Aggregator, CommandLauncher, ExecutionProxy, HeartbeatClock, ProcessLauncher,
    SubscriptionFilter, Supervisor, SupervisorHandle, TelemetryKind, UnixTransport,
};
use qtrader::ipc::{Channel, ControlRequest, TraderStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// qtrader CLI
#[derive(Parser)]
#[command(name = "qtrader")]
#[command(version, about = "Multi-account trading control plane")]
struct Cli {
    /// Config file name (extension optional)
    #[arg(short, long, global = true, default_value = "config")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control process and supervise every enabled account
    Manager,

    /// Run the execution process for one account
    Trader {
        /// Account served by this process
        #[arg(long)]
        account_id: String,

        /// Socket to listen on (defaults to the configured socket dir)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Query a running execution process directly
    Status {
        /// Account to query
        #[arg(long)]
        account_id: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Manager => {
            init_logging("manager.log")?;
            let config = load_config(&cli.config)?;
            run_manager(config, cli.config).await
        }
        Commands::Trader { account_id, socket } => {
            init_logging(&format!("trader_{account_id}.log"))?;
            let config = load_config(&cli.config)?;
            let socket = socket.unwrap_or_else(|| config.socket_path(&account_id));
            qtrader::trader::run(&config, &account_id, &socket).await
        }
        Commands::Status { account_id } => {
            let config = Config::load_from(&cli.config)?;
            show_status(&config, &account_id).await
        }
    }
}

fn load_config(name: &str) -> Result<Config> {
    let config = Config::load_from(name)?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);
    Ok(config)
}

async fn run_manager(config: Config, config_path: String) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            qtrader v{} - Control Process                  ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let launcher: Arc<dyn ProcessLauncher> = match &config.supervisor.trader_binary {
        Some(binary) => Arc::new(CommandLauncher::new(binary)),
        None => Arc::new(
            CommandLauncher::current_exe().context("Failed to resolve current executable")?,
        ),
    };

    let (aggregator, aggregator_task) = Aggregator::spawn(config.aggregator.clone());
    let (supervisor, handle) = Supervisor::new(
        Arc::new(config),
        launcher,
        Arc::new(UnixTransport),
        aggregator.clone(),
    );
    let supervisor_task = supervisor.with_config_path(Some(config_path)).spawn();

    let Some(mut alarms) = aggregator.subscribe(SubscriptionFilter::All).await else {
        anyhow::bail!("Aggregator stopped during startup");
    };
    let mut status_timer = tokio::time::interval(Duration::from_secs(60));

    info!("🚀 Control process running, Ctrl-C to stop");
    loop {
        tokio::select! {
            update = alarms.recv() => {
                let Some(update) = update else { break };
                match update.kind {
                    TelemetryKind::Alarm => warn!(
                        account_id = %update.account_id,
                        alarm = %update.data,
                        "🚨 Alarm"
                    ),
                    TelemetryKind::SystemStatus => info!(
                        account_id = %update.account_id,
                        state = %update.data["state"],
                        "Account state"
                    ),
                    _ => {}
                }
            }
            _ = status_timer.tick() => log_statuses(&handle).await,
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
        }
    }

    drop(alarms);
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Supervisor already stopped");
    }
    if let Err(e) = supervisor_task.await {
        error!(error = %e, "Supervisor task failed");
    }
    aggregator.shutdown();
    if let Err(e) = aggregator_task.await {
        error!(error = %e, "Aggregator task failed");
    }
    info!("👋 Control process stopped");
    Ok(())
}

async fn log_statuses(handle: &SupervisorHandle) {
    match handle.statuses().await {
        Ok(statuses) => {
            for status in statuses {
                info!(
                    account_id = %status.account_id,
                    state = %status.state.as_str(),
                    pid = ?status.pid,
                    restarts = status.restart_count,
                    connected = status.connected,
                    heartbeat_age_ms = ?status.last_heartbeat_age_ms,
                    "📊 Account status"
                );
            }
        }
        Err(e) => warn!(error = %e, "Status query failed"),
    }
}

/// One-shot `status_req` against an execution process socket.
async fn show_status(config: &Config, account_id: &str) -> Result<()> {
    let path = config.socket_path(account_id);
    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .with_context(|| format!("No execution process listening on {}", path.display()))?;

    let (sender, receiver) = Channel::with_capacity(stream, config.ipc.send_capacity).split();
    let proxy = ExecutionProxy::new(
        account_id,
        0,
        sender,
        HeartbeatClock::new(),
        config.ipc.request_timeout(),
    );
    tokio::spawn(proxy.clone().run(receiver));

    let data = proxy
        .send_request(&ControlRequest::Status)
        .await
        .context("Status request failed (is a manager already connected?)")?;
    proxy.close();
    let status: TraderStatus = serde_json::from_value(data)?;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              EXECUTION PROCESS STATUS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("\n📊 Process");
    println!("   ├─ Account:   {}", status.account_id);
    println!("   ├─ PID:       {}", status.pid);
    println!("   ├─ Started:   {}", status.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("   └─ Gateway:   {}", if status.gateway_connected { "connected" } else { "disconnected" });

    if let Some(account) = &status.account {
        println!("\n💰 Account");
        println!("   ├─ Balance:      {:.2}", account.balance);
        println!("   ├─ Available:    {:.2}", account.available);
        println!("   ├─ Margin:       {:.2}", account.margin);
        println!("   └─ Float P/L:    {:.2}", account.float_profit);
    }

    println!("\n📈 Activity");
    println!("   ├─ Active Orders: {}", status.active_orders);
    println!("   └─ Positions:     {}", status.positions.len());
    for position in &status.positions {
        println!(
            "      • {} long {} / short {} (float {:.2})",
            position.symbol, position.pos_long, position.pos_short, position.float_profit
        );
    }

    if !status.strategies.is_empty() {
        println!("\n🧠 Strategies");
        for strategy in &status.strategies {
            let state = if strategy.active { "active" } else { "stopped" };
            println!(
                "   • {} [{}] symbols={:?} owned_orders={}",
                strategy.strategy_id, state, strategy.symbols, strategy.owned_orders
            );
            if let Some(err) = &strategy.last_error {
                println!("     last error: {}", err);
            }
        }
    }

    Ok(())
}

/// Initialize logging with file output to stdout and an hourly rolling file.
fn init_logging(file_name: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("qtrader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Socket Dir: {}", config.ipc.socket_dir);
    info!(
        "   Heartbeat: every {}s, timeout {}s",
        config.ipc.heartbeat_interval_secs, config.supervisor.heartbeat_timeout_secs
    );
    info!("   Request Timeout: {}s", config.ipc.request_timeout_secs);
    info!(
        "   Health Check: every {}s, degraded grace {}s",
        config.supervisor.health_check_interval_secs, config.supervisor.degraded_grace_secs
    );
    info!(
        "   Restart Backoff: {}ms .. {}s, ceiling {}",
        config.supervisor.restart_backoff_base_ms,
        config.supervisor.restart_backoff_max_secs,
        config.supervisor.max_restarts
    );
    info!(
        "   Account Flush: {}ms, trade window {}",
        config.aggregator.account_flush_interval_ms, config.aggregator.trade_window
    );
    for account in &config.accounts {
        info!(
            "   Account {}: {} ({} strategies)",
            account.account_id,
            if account.enabled { "enabled" } else { "disabled" },
            account.strategies.len()
        );
    }
}
