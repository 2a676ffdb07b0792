//! # qtrader
//!
//! Control plane for multi-account trading. A control process supervises
//! one execution process per account and talks to each over a framed Unix
//! socket channel; execution processes host strategies behind a gateway.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `models`: Orders, trades, positions, accounts, ticks and alarms
//! - `ipc`: Envelope codec, framed channel and typed messages
//! - `control`: Supervisor, runtime registry, execution proxy and aggregator
//! - `trader`: Channel server, trading engine, strategy router, gateway and risk
//! - `error`: Error taxonomy shared by both processes

pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod models;
pub mod trader;

pub use config::Config;
