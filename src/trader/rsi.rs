//! Demo RSI mean-reversion strategy.
//!
//! Buys when Wilder's RSI drops below the oversold level while flat, and
//! sells the position back when RSI rises above the overbought level. One
//! working order at a time.

use super::strategy::{Strategy, StrategyContext};
use crate::config::StrategyConfig;
use crate::error::StrategyError;
use crate::models::{Direction, Offset, OrderData, OrderRequest, TickData, TradeData};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

/// Wilder-smoothed relative strength index.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev: Option<Decimal>,
    samples: usize,
    avg_gain: Decimal,
    avg_loss: Decimal,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev: None,
            samples: 0,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
        }
    }

    /// Feed a price, returning the RSI once `period` changes were seen.
    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        let prev = self.prev.replace(price)?;
        let change = price - prev;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let period = Decimal::from(self.period as u64);

        self.samples += 1;
        if self.samples <= self.period {
            // Seed with a simple average over the first period.
            self.avg_gain += gain / period;
            self.avg_loss += loss / period;
            if self.samples < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (period - Decimal::ONE) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - Decimal::ONE) + loss) / period;
        }

        if self.avg_loss.is_zero() {
            return Some(if self.avg_gain.is_zero() { dec!(50) } else { dec!(100) });
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(dec!(100) - dec!(100) / (Decimal::ONE + rs))
    }
}

pub struct RsiStrategy {
    strategy_id: String,
    symbols: Vec<String>,
    volume: u32,
    oversold: Decimal,
    overbought: Decimal,
    rsi: Rsi,
    position: i64,
    working_order: Option<String>,
}

impl RsiStrategy {
    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            strategy_id: config.strategy_id.clone(),
            symbols: vec![config.symbol.clone()],
            volume: config.volume,
            oversold: config.rsi_oversold,
            overbought: config.rsi_overbought,
            rsi: Rsi::new(config.rsi_period),
            position: 0,
            working_order: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }
}

impl Strategy for RsiStrategy {
    fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn on_tick(
        &mut self,
        tick: &TickData,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        let Some(rsi) = self.rsi.update(tick.last_price) else {
            return Ok(());
        };
        if self.working_order.is_some() {
            return Ok(());
        }

        let request = if rsi < self.oversold && self.position == 0 {
            OrderRequest::limit(&tick.symbol, Direction::Buy, self.volume, tick.last_price)
        } else if rsi > self.overbought && self.position > 0 {
            let volume = u32::try_from(self.position)
                .map_err(|_| StrategyError::Callback("position out of range".into()))?;
            OrderRequest::limit(&tick.symbol, Direction::Sell, volume, tick.last_price)
                .with_offset(Offset::Close)
        } else {
            return Ok(());
        };

        let order_id = ctx.submit_order(request);
        info!(
            strategy_id = %self.strategy_id,
            %order_id,
            symbol = %tick.symbol,
            %rsi,
            price = %tick.last_price,
            "RSI signal"
        );
        self.working_order = Some(order_id);
        Ok(())
    }

    fn on_order(
        &mut self,
        order: &OrderData,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        if order.is_terminal() && self.working_order.as_deref() == Some(order.order_id.as_str()) {
            debug!(strategy_id = %self.strategy_id, order_id = %order.order_id, status = ?order.status, "Working order done");
            self.working_order = None;
        }
        Ok(())
    }

    fn on_trade(
        &mut self,
        trade: &TradeData,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        let volume = i64::from(trade.volume);
        match trade.direction {
            Direction::Buy => self.position += volume,
            Direction::Sell => self.position -= volume,
        }
        if self.position < 0 {
            warn!(strategy_id = %self.strategy_id, position = self.position, "Unexpected short position");
        }
        Ok(())
    }
}

/// Build a strategy from its configuration. `None` for unknown types.
pub fn build_strategy(config: &StrategyConfig) -> Option<Box<dyn Strategy>> {
    match config.strategy_type.as_str() {
        "rsi" => Some(Box::new(RsiStrategy::from_config(config))),
        other => {
            warn!(strategy_id = %config.strategy_id, strategy_type = %other, "Unknown strategy type");
            None
        }
    }
}
