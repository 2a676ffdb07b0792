//! Strategy callbacks and the narrow context they act through.
//!
//! Strategies never see the engine. Orders they submit get an id and an
//! ownership entry immediately; the engine executes the resulting intents
//! after the callback returns.

use super::router::{record_submission, OrderIdAllocator, OwnershipTable};
use crate::error::StrategyError;
use crate::models::{OrderData, OrderRequest, TickData, TradeData};

/// A trading strategy hosted by the router.
///
/// Callbacks run on the engine task and must not block. Returning an error
/// (or panicking) disables the strategy.
pub trait Strategy: Send {
    fn strategy_id(&self) -> &str;

    /// Symbols whose ticks this strategy receives. Empty means all.
    fn symbols(&self) -> &[String];

    fn on_tick(
        &mut self,
        tick: &TickData,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError>;

    fn on_order(
        &mut self,
        _order: &OrderData,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_trade(
        &mut self,
        _trade: &TradeData,
        _ctx: &mut StrategyContext<'_>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }
}

/// Work a strategy asked for during a callback.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    Submit {
        order_id: String,
        strategy_id: String,
        request: OrderRequest,
    },
    Cancel {
        order_id: String,
        strategy_id: String,
    },
}

/// Everything a strategy may do from inside a callback.
pub struct StrategyContext<'a> {
    strategy_id: &'a str,
    ownership: &'a mut OwnershipTable,
    allocator: &'a mut OrderIdAllocator,
    intents: &'a mut Vec<OrderIntent>,
    submitted: Vec<String>,
}

impl<'a> StrategyContext<'a> {
    pub(crate) fn new(
        strategy_id: &'a str,
        ownership: &'a mut OwnershipTable,
        allocator: &'a mut OrderIdAllocator,
        intents: &'a mut Vec<OrderIntent>,
    ) -> Self {
        Self {
            strategy_id,
            ownership,
            allocator,
            intents,
            submitted: Vec::new(),
        }
    }

    pub fn strategy_id(&self) -> &str {
        self.strategy_id
    }

    /// Submit an order. Ownership is recorded before this returns.
    pub fn submit_order(&mut self, request: OrderRequest) -> String {
        let order_id =
            record_submission(self.ownership, self.allocator, self.strategy_id, &request);
        self.submitted.push(order_id.clone());
        self.intents.push(OrderIntent::Submit {
            order_id: order_id.clone(),
            strategy_id: self.strategy_id.to_string(),
            request,
        });
        order_id
    }

    /// Cancel an order this strategy owns.
    pub fn cancel_order(&mut self, order_id: &str) -> Result<(), StrategyError> {
        if self.ownership.owner_of(order_id) != Some(self.strategy_id) {
            return Err(StrategyError::NotOwner {
                order_id: order_id.to_string(),
                strategy_id: self.strategy_id.to_string(),
            });
        }
        self.intents.push(OrderIntent::Cancel {
            order_id: order_id.to_string(),
            strategy_id: self.strategy_id.to_string(),
        });
        Ok(())
    }

    /// Whether this strategy owns `order_id`.
    pub fn owns(&self, order_id: &str) -> bool {
        self.ownership.owner_of(order_id) == Some(self.strategy_id)
    }

    /// Order ids submitted during this callback.
    pub(crate) fn into_submitted(self) -> Vec<String> {
        self.submitted
    }
}
