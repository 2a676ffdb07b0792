//! Brokerage gateway seam and a paper-trading implementation.
//!
//! Adapters report everything that happens at the broker as
//! [`GatewayEvent`]s on a channel handed to them at construction.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{
    AccountData, Direction, Offset, OrderData, OrderRequest, OrderStatus, OrderType, PositionData,
    TickData, TradeData,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Broker-side happenings.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Tick(TickData),
    Order(OrderData),
    Trade(TradeData),
    Position(PositionData),
    Account(AccountData),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, symbols: &[String]) -> Result<(), GatewayError>;

    /// Submit an order under an id chosen by the caller. Acceptance is
    /// reported through order events; an `Err` means it never reached the
    /// broker.
    async fn send_order(&self, order_id: &str, request: &OrderRequest) -> Result<(), GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn query_account(&self) -> Result<AccountData, GatewayError>;
}

/// Simulated position per symbol.
#[derive(Debug, Clone, Default)]
struct PaperPosition {
    long: u32,
    long_price: Decimal,
    short: u32,
    short_price: Decimal,
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    last_prices: HashMap<String, Decimal>,
    positions: HashMap<String, PaperPosition>,
    resting: HashMap<String, OrderData>,
    subscribed: BTreeSet<String>,
}

/// In-process broker simulation.
///
/// Marketable orders fill in full at the last price; other limit orders
/// rest until a tick crosses them.
pub struct PaperGateway {
    account_id: String,
    config: GatewayConfig,
    state: Arc<RwLock<PaperState>>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    connected: AtomicBool,
    trade_counter: AtomicU64,
    /// Commission as a fraction of notional.
    commission_rate: Decimal,
    margin_rate: Decimal,
}

impl PaperGateway {
    pub fn new(
        account_id: &str,
        config: GatewayConfig,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        let state = PaperState {
            balance: config.initial_balance,
            last_prices: HashMap::new(),
            positions: HashMap::new(),
            resting: HashMap::new(),
            subscribed: BTreeSet::new(),
        };
        Self {
            account_id: account_id.to_string(),
            config,
            state: Arc::new(RwLock::new(state)),
            events,
            connected: AtomicBool::new(false),
            trade_counter: AtomicU64::new(0),
            commission_rate: dec!(0.0001),
            margin_rate: dec!(0.1),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            debug!(account_id = %self.account_id, "Gateway event dropped, engine gone");
        }
    }

    /// Apply a market price: publish the tick and fill crossed resting orders.
    pub async fn on_tick(&self, tick: TickData) {
        let mut state = self.state.write().await;
        state
            .last_prices
            .insert(tick.symbol.clone(), tick.last_price);
        self.emit(GatewayEvent::Tick(tick.clone()));

        let crossed: Vec<String> = state
            .resting
            .values()
            .filter(|o| o.symbol == tick.symbol && crosses(o, tick.last_price))
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in crossed {
            if let Some(order) = state.resting.remove(&order_id) {
                self.fill(&mut state, order, tick.last_price);
            }
        }
    }

    /// Symbols currently subscribed.
    pub async fn subscribed(&self) -> Vec<String> {
        self.state.read().await.subscribed.iter().cloned().collect()
    }

    fn fill(&self, state: &mut PaperState, mut order: OrderData, price: Decimal) {
        let volume = order.volume_left();
        let commission = price * Decimal::from(volume) * self.commission_rate;
        let trade_no = self.trade_counter.fetch_add(1, Ordering::Relaxed) + 1;

        let position = state.positions.entry(order.symbol.clone()).or_default();
        let realized = apply_fill(position, order.direction, order.offset, volume, price);
        state.balance += realized - commission;

        order.traded = order.volume;
        order.status = OrderStatus::Filled;
        order.update_time = Utc::now();

        let trade = TradeData {
            trade_id: format!("{}-T{}", self.account_id, trade_no),
            order_id: order.order_id.clone(),
            account_id: self.account_id.clone(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            offset: order.offset,
            price,
            volume,
            commission,
            trade_time: Utc::now(),
        };

        debug!(
            account_id = %self.account_id,
            order_id = %order.order_id,
            symbol = %order.symbol,
            %price,
            volume,
            "Paper fill"
        );

        // Trade before the terminal order update, which releases ownership.
        let position = self.position_data(state, &order.symbol);
        self.emit(GatewayEvent::Trade(trade));
        self.emit(GatewayEvent::Order(order));
        self.emit(GatewayEvent::Position(position));
        self.emit(GatewayEvent::Account(self.account_data(state)));
    }

    fn position_data(&self, state: &PaperState, symbol: &str) -> PositionData {
        let mut data = PositionData::flat(&self.account_id, symbol);
        if let Some(pos) = state.positions.get(symbol) {
            let last = state.last_prices.get(symbol).copied();
            data.pos_long = pos.long;
            data.pos_short = pos.short;
            data.open_price_long = (pos.long > 0).then_some(pos.long_price);
            data.open_price_short = (pos.short > 0).then_some(pos.short_price);
            data.float_profit = last.map_or(Decimal::ZERO, |p| float_profit(pos, p));
        }
        data
    }

    fn account_data(&self, state: &PaperState) -> AccountData {
        let mut margin = Decimal::ZERO;
        let mut float = Decimal::ZERO;
        for (symbol, pos) in &state.positions {
            margin += (Decimal::from(pos.long) * pos.long_price
                + Decimal::from(pos.short) * pos.short_price)
                * self.margin_rate;
            if let Some(&price) = state.last_prices.get(symbol) {
                float += float_profit(pos, price);
            }
        }
        AccountData {
            account_id: self.account_id.clone(),
            balance: state.balance,
            available: state.balance + float - margin,
            margin,
            float_profit: float,
            gateway_connected: self.is_connected(),
            trade_paused: false,
            update_time: Utc::now(),
        }
    }
}

#[async_trait]
impl Gateway for PaperGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        info!(account_id = %self.account_id, "Paper gateway connected");
        let state = self.state.read().await;
        self.emit(GatewayEvent::Account(self.account_data(&state)));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut state = self.state.write().await;
        state.subscribed.extend(symbols.iter().cloned());
        info!(account_id = %self.account_id, ?symbols, "Subscribed market data");
        Ok(())
    }

    async fn send_order(&self, order_id: &str, request: &OrderRequest) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        if request.volume == 0 {
            return Err(GatewayError::Rejected("volume must be positive".into()));
        }

        let mut state = self.state.write().await;
        let last = state.last_prices.get(&request.symbol).copied();
        let fill_price = match (request.order_type, request.price, last) {
            (OrderType::Market, _, Some(last)) => Some(last),
            (OrderType::Market, _, None) => {
                return Err(GatewayError::Rejected(format!(
                    "no market price for {}",
                    request.symbol
                )));
            }
            (OrderType::Limit, None, _) => {
                return Err(GatewayError::Rejected("limit order without price".into()));
            }
            (OrderType::Limit, Some(limit), Some(last)) => {
                let marketable = match request.direction {
                    Direction::Buy => limit >= last,
                    Direction::Sell => limit <= last,
                };
                marketable.then_some(last)
            }
            (OrderType::Limit, Some(_), None) => None,
        };

        if let Some(pos) = state.positions.get(&request.symbol) {
            let closable = match request.direction {
                Direction::Sell => pos.long,
                Direction::Buy => pos.short,
            };
            if request.offset != Offset::Open && request.volume > closable {
                return Err(GatewayError::Rejected(format!(
                    "close volume {} exceeds position {}",
                    request.volume, closable
                )));
            }
        } else if request.offset != Offset::Open {
            return Err(GatewayError::Rejected("no position to close".into()));
        }

        let order = OrderData::from_request(order_id, &self.account_id, request);
        self.emit(GatewayEvent::Order(order.clone()));

        match fill_price {
            Some(price) => self.fill(&mut state, order, price),
            None => {
                debug!(account_id = %self.account_id, %order_id, "Order resting");
                state.resting.insert(order_id.to_string(), order);
            }
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut state = self.state.write().await;
        let Some(mut order) = state.resting.remove(order_id) else {
            return Err(GatewayError::UnknownOrder(order_id.to_string()));
        };
        order.status = OrderStatus::Cancelled;
        order.update_time = Utc::now();
        self.emit(GatewayEvent::Order(order));
        Ok(())
    }

    async fn query_account(&self) -> Result<AccountData, GatewayError> {
        let state = self.state.read().await;
        Ok(self.account_data(&state))
    }
}

fn crosses(order: &OrderData, last: Decimal) -> bool {
    match (order.direction, order.price) {
        (Direction::Buy, Some(limit)) => last <= limit,
        (Direction::Sell, Some(limit)) => last >= limit,
        (_, None) => true,
    }
}

/// Update a position with a fill; returns realized profit.
fn apply_fill(
    pos: &mut PaperPosition,
    direction: Direction,
    offset: Offset,
    volume: u32,
    price: Decimal,
) -> Decimal {
    let qty = Decimal::from(volume);
    match (direction, offset) {
        (Direction::Buy, Offset::Open) => {
            let total = Decimal::from(pos.long) * pos.long_price + qty * price;
            pos.long += volume;
            pos.long_price = total / Decimal::from(pos.long);
            Decimal::ZERO
        }
        (Direction::Sell, Offset::Open) => {
            let total = Decimal::from(pos.short) * pos.short_price + qty * price;
            pos.short += volume;
            pos.short_price = total / Decimal::from(pos.short);
            Decimal::ZERO
        }
        (Direction::Sell, _) => {
            let closed = volume.min(pos.long);
            pos.long -= closed;
            (price - pos.long_price) * Decimal::from(closed)
        }
        (Direction::Buy, _) => {
            let closed = volume.min(pos.short);
            pos.short -= closed;
            (pos.short_price - price) * Decimal::from(closed)
        }
    }
}

fn float_profit(pos: &PaperPosition, price: Decimal) -> Decimal {
    (price - pos.long_price) * Decimal::from(pos.long)
        + (pos.short_price - price) * Decimal::from(pos.short)
}

/// Price path the paper feed walks, in ticks.
const STEP_PATTERN: [i64; 12] = [1, 2, 1, -1, -2, -3, -2, -1, 1, 3, 2, -1];

/// Drive the paper gateway with synthetic ticks for its subscribed symbols
/// until `shutdown` flips.
pub async fn run_paper_feed(gateway: Arc<PaperGateway>, mut shutdown: watch::Receiver<bool>) {
    if gateway.config.tick_interval_ms == 0 {
        info!(account_id = %gateway.account_id, "Paper feed disabled");
        return;
    }
    let period = Duration::from_millis(gateway.config.tick_interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prices: HashMap<String, Decimal> = HashMap::new();
    let mut step = 0usize;

    while !*shutdown.borrow_and_update() {
        tokio::select! {
            _ = ticker.tick() => {}
            res = shutdown.changed() => {
                if res.is_err() {
                    warn!("Paper feed shutdown signal lost");
                    break;
                }
                continue;
            }
        }

        let delta = Decimal::from(STEP_PATTERN[step % STEP_PATTERN.len()]) * gateway.config.price_tick;
        step += 1;
        for symbol in gateway.subscribed().await {
            let price = prices
                .entry(symbol.clone())
                .or_insert(gateway.config.base_price);
            *price = (*price + delta).max(gateway.config.price_tick);
            gateway.on_tick(TickData::new(&symbol, *price)).await;
        }
    }
    debug!(account_id = %gateway.account_id, "Paper feed stopped");
}
