//! Execution process for a single account.
//!
//! - `server`: control-channel endpoint (register, heartbeats, pushes)
//! - `engine`: order flow, telemetry caches and request handling
//! - `router`: strategy hosting with order ownership
//! - `strategy`: strategy trait and callback context
//! - `gateway`: brokerage seam and paper gateway
//! - `risk`: pre-trade checks
//! - `rsi`: bundled demo strategy

pub mod engine;
pub mod gateway;
pub mod risk;
pub mod router;
pub mod rsi;
pub mod server;
pub mod strategy;

pub use engine::{EngineHandle, EngineRequests, TradingEngine};
pub use gateway::{run_paper_feed, Gateway, GatewayEvent, PaperGateway};
pub use risk::{OrderLimits, RiskGate};
pub use router::{OrderIdAllocator, OwnershipTable, StrategyRouter};
pub use server::{ChannelServer, PushHandle, RequestHandler};
pub use strategy::{OrderIntent, Strategy, StrategyContext};

use crate::config::{AccountConfig, Config};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Serve `account_id` on `socket` until a stop request or interrupt.
pub async fn run(config: &Config, account_id: &str, socket: &Path) -> Result<()> {
    let account = match config.account(account_id) {
        Some(account) => account.clone(),
        None => {
            warn!(%account_id, "Account not in configuration, using defaults");
            AccountConfig::new(account_id)
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(PaperGateway::new(
        account_id,
        account.gateway.clone(),
        events_tx,
    ));

    let mut router = StrategyRouter::new(account_id);
    for strategy_config in &account.strategies {
        let Some(strategy) = rsi::build_strategy(strategy_config) else {
            continue;
        };
        if router.register(strategy) && !strategy_config.enabled {
            router.set_active(&strategy_config.strategy_id, false);
        }
    }

    let (handle, requests) = EngineHandle::channel();
    let server = ChannelServer::new(account_id, &config.ipc, Arc::new(handle));
    let engine = TradingEngine::new(
        account_id,
        gateway.clone(),
        Box::new(OrderLimits::new(account.risk.clone())),
        router,
        server.push_handle(),
        events_rx,
        requests,
    )
    .with_account_push_interval(Duration::from_secs(
        account.gateway.account_push_interval_secs,
    ));

    let feed = tokio::spawn(run_paper_feed(gateway, server.shutdown_signal()));
    let engine_task = tokio::spawn(engine.run(server.shutdown_signal()));
    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                server.shutdown();
            }
        });
    }

    info!(
        %account_id,
        pid = std::process::id(),
        strategies = account.strategies.len(),
        "Execution process started"
    );

    server
        .run(socket)
        .await
        .with_context(|| format!("Channel server failed on {}", socket.display()))?;

    if let Err(e) = engine_task.await {
        warn!(error = %e, "Engine task ended abnormally");
    }
    if let Err(e) = feed.await {
        warn!(error = %e, "Paper feed ended abnormally");
    }
    info!(%account_id, "Execution process exiting");
    Ok(())
}
