//! Strategy event routing and order ownership.
//!
//! Market data is broadcast to every active strategy in registration order.
//! Order and trade events are unicast to the strategy that owns the order.
//! A callback that fails or panics disables its strategy; the others keep
//! running.

use super::strategy::{OrderIntent, Strategy, StrategyContext};
use crate::error::StrategyError;
use crate::ipc::StrategyInfo;
use crate::models::{OrderData, OrderRequest, TickData, TradeData};
use chrono::Utc;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

/// Generates order ids unique to one execution process run.
#[derive(Debug)]
pub struct OrderIdAllocator {
    prefix: String,
    counter: u64,
}

impl OrderIdAllocator {
    pub fn new(account_id: &str) -> Self {
        Self {
            prefix: format!("{}-{}", account_id, Utc::now().timestamp_millis()),
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.prefix, self.counter)
    }
}

/// `order_id -> strategy_id` for every live strategy order.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    owners: HashMap<String, String>,
}

impl OwnershipTable {
    pub fn record(&mut self, order_id: &str, strategy_id: &str) {
        self.owners
            .insert(order_id.to_string(), strategy_id.to_string());
    }

    pub fn owner_of(&self, order_id: &str) -> Option<&str> {
        self.owners.get(order_id).map(String::as_str)
    }

    pub fn release(&mut self, order_id: &str) -> Option<String> {
        self.owners.remove(order_id)
    }

    pub fn owned_by(&self, strategy_id: &str) -> usize {
        self.owners.values().filter(|s| *s == strategy_id).count()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Allocate an id for a strategy order and record its owner. Every strategy
/// submission goes through here before the order is forwarded.
pub(crate) fn record_submission(
    ownership: &mut OwnershipTable,
    allocator: &mut OrderIdAllocator,
    strategy_id: &str,
    request: &OrderRequest,
) -> String {
    let order_id = allocator.next_id();
    ownership.record(&order_id, strategy_id);
    debug!(%order_id, %strategy_id, symbol = %request.symbol, "Order ownership recorded");
    order_id
}

struct StrategySlot {
    strategy: Box<dyn Strategy>,
    active: bool,
    last_error: Option<String>,
}

/// A strategy disabled during dispatch.
#[derive(Debug, Clone)]
pub struct StrategyFailure {
    pub strategy_id: String,
    pub error: StrategyError,
}

/// Result of one dispatch: intents to execute and strategies that failed.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub intents: Vec<OrderIntent>,
    pub failures: Vec<StrategyFailure>,
}

impl DispatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.failures.is_empty()
    }
}

pub struct StrategyRouter {
    slots: Vec<StrategySlot>,
    ownership: OwnershipTable,
    allocator: OrderIdAllocator,
}

impl StrategyRouter {
    pub fn new(account_id: &str) -> Self {
        Self {
            slots: Vec::new(),
            ownership: OwnershipTable::default(),
            allocator: OrderIdAllocator::new(account_id),
        }
    }

    /// Add a strategy, active. Refuses duplicate ids.
    pub fn register(&mut self, strategy: Box<dyn Strategy>) -> bool {
        let strategy_id = strategy.strategy_id().to_string();
        if self.slot_index(&strategy_id).is_some() {
            warn!(%strategy_id, "Strategy already registered");
            return false;
        }
        info!(%strategy_id, symbols = ?strategy.symbols(), "Strategy registered");
        self.slots.push(StrategySlot {
            strategy,
            active: true,
            last_error: None,
        });
        true
    }

    /// Every symbol some strategy listens to.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .slots
            .iter()
            .flat_map(|slot| slot.strategy.symbols().iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Broadcast a tick to every active strategy subscribed to its symbol.
    pub fn dispatch_market_data(&mut self, tick: &TickData) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let Self {
            slots,
            ownership,
            allocator,
        } = self;

        for slot in slots.iter_mut().filter(|s| s.active) {
            let symbols = slot.strategy.symbols();
            if !symbols.is_empty() && !symbols.iter().any(|s| *s == tick.symbol) {
                continue;
            }
            invoke(slot, ownership, allocator, &mut outcome, |strategy, ctx| {
                strategy.on_tick(tick, ctx)
            });
        }
        outcome
    }

    /// Record ownership for an order a strategy is about to submit.
    pub fn on_order_submit(&mut self, strategy_id: &str, request: &OrderRequest) -> String {
        record_submission(&mut self.ownership, &mut self.allocator, strategy_id, request)
    }

    /// Id for an order with no owning strategy.
    pub fn allocate_order_id(&mut self) -> String {
        self.allocator.next_id()
    }

    /// Deliver an order update to its owner; terminal updates release ownership.
    pub fn dispatch_order_event(&mut self, order: &OrderData) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        match self.ownership.owner_of(&order.order_id).map(str::to_string) {
            Some(strategy_id) => {
                if let Some(index) = self.active_slot(&strategy_id) {
                    let Self {
                        slots,
                        ownership,
                        allocator,
                    } = self;
                    invoke(&mut slots[index], ownership, allocator, &mut outcome, |strategy, ctx| {
                        strategy.on_order(order, ctx)
                    });
                } else {
                    debug!(order_id = %order.order_id, %strategy_id, "Owner inactive, order event dropped");
                }
            }
            None => {
                debug!(order_id = %order.order_id, "Order has no owning strategy");
            }
        }

        if order.is_terminal() {
            self.on_order_terminal(&order.order_id);
        }
        outcome
    }

    /// Deliver a fill to the strategy that owns its order.
    pub fn dispatch_trade_event(&mut self, trade: &TradeData) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let Some(strategy_id) = self.ownership.owner_of(&trade.order_id).map(str::to_string) else {
            debug!(trade_id = %trade.trade_id, order_id = %trade.order_id, "Trade has no owning strategy");
            return outcome;
        };
        let Some(index) = self.active_slot(&strategy_id) else {
            debug!(trade_id = %trade.trade_id, %strategy_id, "Owner inactive, trade dropped");
            return outcome;
        };

        let Self {
            slots,
            ownership,
            allocator,
        } = self;
        invoke(&mut slots[index], ownership, allocator, &mut outcome, |strategy, ctx| {
            strategy.on_trade(trade, ctx)
        });
        outcome
    }

    /// Drop ownership of a filled, cancelled or rejected order.
    pub fn on_order_terminal(&mut self, order_id: &str) -> Option<String> {
        let owner = self.ownership.release(order_id);
        if let Some(strategy_id) = &owner {
            debug!(%order_id, %strategy_id, "Order ownership released");
        }
        owner
    }

    pub fn owner_of(&self, order_id: &str) -> Option<&str> {
        self.ownership.owner_of(order_id)
    }

    pub fn owned_orders(&self) -> usize {
        self.ownership.len()
    }

    /// Enable or disable a strategy. Returns false for unknown ids.
    pub fn set_active(&mut self, strategy_id: &str, active: bool) -> bool {
        let Some(index) = self.slot_index(strategy_id) else {
            return false;
        };
        let slot = &mut self.slots[index];
        if active && !slot.active {
            slot.last_error = None;
        }
        slot.active = active;
        info!(%strategy_id, active, "Strategy state changed");
        true
    }

    pub fn strategies(&self) -> Vec<StrategyInfo> {
        self.slots
            .iter()
            .map(|slot| {
                let strategy_id = slot.strategy.strategy_id().to_string();
                StrategyInfo {
                    owned_orders: self.ownership.owned_by(&strategy_id),
                    strategy_id,
                    active: slot.active,
                    symbols: slot.strategy.symbols().to_vec(),
                    last_error: slot.last_error.clone(),
                }
            })
            .collect()
    }

    fn slot_index(&self, strategy_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.strategy.strategy_id() == strategy_id)
    }

    fn active_slot(&self, strategy_id: &str) -> Option<usize> {
        self.slot_index(strategy_id)
            .filter(|&index| self.slots[index].active)
    }
}

/// Run one callback in isolation. On failure the strategy's orders from this
/// callback are forgotten and the strategy is disabled.
fn invoke<F>(
    slot: &mut StrategySlot,
    ownership: &mut OwnershipTable,
    allocator: &mut OrderIdAllocator,
    outcome: &mut DispatchOutcome,
    callback: F,
) where
    F: FnOnce(&mut dyn Strategy, &mut StrategyContext<'_>) -> Result<(), StrategyError>,
{
    let strategy_id = slot.strategy.strategy_id().to_string();
    let mark = outcome.intents.len();

    let mut ctx = StrategyContext::new(&strategy_id, ownership, allocator, &mut outcome.intents);
    let strategy = slot.strategy.as_mut();
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(strategy, &mut ctx)));
    let submitted = ctx.into_submitted();

    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => StrategyError::Panicked(panic_message(payload.as_ref())),
    };

    for order_id in &submitted {
        ownership.release(order_id);
    }
    outcome.intents.truncate(mark);

    error!(%strategy_id, error = %error, "Strategy failed, disabling");
    slot.active = false;
    slot.last_error = Some(error.to_string());
    outcome.failures.push(StrategyFailure { strategy_id, error });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, OrderStatus};
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Quiet,
        OrderOnTick,
        FailOnTick,
        PanicOnTick,
        OrderThenFail,
    }

    /// Records every callback into a shared log.
    struct Scripted {
        id: String,
        symbols: Vec<String>,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn boxed(
            id: &str,
            symbols: &[&str],
            behaviour: Behaviour,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Strategy> {
            Box::new(Self {
                id: id.to_string(),
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                behaviour,
                log: log.clone(),
            })
        }
    }

    impl Strategy for Scripted {
        fn strategy_id(&self) -> &str {
            &self.id
        }

        fn symbols(&self) -> &[String] {
            &self.symbols
        }

        fn on_tick(
            &mut self,
            tick: &TickData,
            ctx: &mut StrategyContext<'_>,
        ) -> Result<(), StrategyError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:tick:{}", self.id, tick.symbol));
            match self.behaviour {
                Behaviour::Quiet => Ok(()),
                Behaviour::OrderOnTick => {
                    ctx.submit_order(OrderRequest::limit(
                        &tick.symbol,
                        Direction::Buy,
                        1,
                        tick.last_price,
                    ));
                    Ok(())
                }
                Behaviour::FailOnTick => Err(StrategyError::Callback("bad signal".into())),
                Behaviour::PanicOnTick => panic!("strategy bug"),
                Behaviour::OrderThenFail => {
                    ctx.submit_order(OrderRequest::market(&tick.symbol, Direction::Sell, 1));
                    Err(StrategyError::Callback("after submit".into()))
                }
            }
        }

        fn on_order(
            &mut self,
            order: &OrderData,
            _ctx: &mut StrategyContext<'_>,
        ) -> Result<(), StrategyError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:order:{:?}", self.id, order.status));
            Ok(())
        }

        fn on_trade(
            &mut self,
            trade: &TradeData,
            _ctx: &mut StrategyContext<'_>,
        ) -> Result<(), StrategyError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:trade:{}", self.id, trade.trade_id));
            Ok(())
        }
    }

    fn tick(symbol: &str) -> TickData {
        TickData::new(symbol, dec!(3500))
    }

    fn order_update(order_id: &str, status: OrderStatus) -> OrderData {
        let req = OrderRequest::limit("rb2501", Direction::Buy, 1, dec!(3500));
        let mut order = OrderData::from_request(order_id, "acc1", &req);
        order.status = status;
        order
    }

    fn trade(order_id: &str) -> TradeData {
        TradeData {
            trade_id: "t1".into(),
            order_id: order_id.into(),
            account_id: "acc1".into(),
            symbol: "rb2501".into(),
            direction: Direction::Buy,
            offset: Default::default(),
            price: dec!(3500),
            volume: 1,
            commission: dec!(0.35),
            trade_time: Utc::now(),
        }
    }

    fn submitted_id(outcome: &DispatchOutcome) -> String {
        match &outcome.intents[0] {
            OrderIntent::Submit { order_id, .. } => order_id.clone(),
            other => panic!("unexpected intent {other:?}"),
        }
    }

    #[test]
    fn test_market_data_in_registration_order_filtered_by_symbol() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("a", &["rb2501"], Behaviour::Quiet, &log));
        router.register(Scripted::boxed("b", &[], Behaviour::Quiet, &log));
        router.register(Scripted::boxed("c", &["ag2506"], Behaviour::Quiet, &log));

        router.dispatch_market_data(&tick("rb2501"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:tick:rb2501".to_string(), "b:tick:rb2501".to_string()]
        );
    }

    #[test]
    fn test_ownership_recorded_before_submission_and_routed_to_owner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("s1", &[], Behaviour::OrderOnTick, &log));
        router.register(Scripted::boxed("s2", &[], Behaviour::Quiet, &log));

        let outcome = router.dispatch_market_data(&tick("rb2501"));
        assert_eq!(outcome.intents.len(), 1);
        let order_id = submitted_id(&outcome);
        assert_eq!(router.owner_of(&order_id), Some("s1"));

        log.lock().unwrap().clear();
        router.dispatch_order_event(&order_update(&order_id, OrderStatus::Pending));
        router.dispatch_trade_event(&trade(&order_id));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["s1:order:Pending".to_string(), "s1:trade:t1".to_string()]
        );
    }

    #[test]
    fn test_terminal_status_releases_ownership() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("s1", &[], Behaviour::OrderOnTick, &log));

        for status in [OrderStatus::Filled, OrderStatus::Cancelled, OrderStatus::Rejected] {
            let outcome = router.dispatch_market_data(&tick("rb2501"));
            let order_id = submitted_id(&outcome);
            router.dispatch_order_event(&order_update(&order_id, OrderStatus::PartiallyFilled));
            assert_eq!(router.owner_of(&order_id), Some("s1"));

            router.dispatch_order_event(&order_update(&order_id, status));
            assert_eq!(router.owner_of(&order_id), None);
        }
        assert_eq!(router.owned_orders(), 0);
    }

    #[test]
    fn test_unowned_events_are_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("s1", &[], Behaviour::Quiet, &log));

        let outcome = router.dispatch_order_event(&order_update("manual-1", OrderStatus::Filled));
        assert!(outcome.is_empty());
        router.dispatch_trade_event(&trade("manual-1"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_strategy_is_disabled_and_others_continue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("bad", &[], Behaviour::FailOnTick, &log));
        router.register(Scripted::boxed("good", &[], Behaviour::Quiet, &log));

        let outcome = router.dispatch_market_data(&tick("rb2501"));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].strategy_id, "bad");

        router.dispatch_market_data(&tick("rb2501"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "bad:tick:rb2501".to_string(),
                "good:tick:rb2501".to_string(),
                "good:tick:rb2501".to_string(),
            ]
        );

        let infos = router.strategies();
        assert!(!infos[0].active);
        assert!(infos[0].last_error.as_deref().unwrap().contains("bad signal"));
        assert!(infos[1].active);
    }

    #[test]
    fn test_panicking_strategy_is_contained() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("boom", &[], Behaviour::PanicOnTick, &log));
        router.register(Scripted::boxed("good", &[], Behaviour::OrderOnTick, &log));

        let outcome = router.dispatch_market_data(&tick("rb2501"));
        assert!(matches!(
            outcome.failures[0].error,
            StrategyError::Panicked(ref msg) if msg == "strategy bug"
        ));
        assert_eq!(outcome.intents.len(), 1);
    }

    #[test]
    fn test_failed_callback_rolls_back_its_orders() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        router.register(Scripted::boxed("flaky", &[], Behaviour::OrderThenFail, &log));

        let outcome = router.dispatch_market_data(&tick("rb2501"));
        assert!(outcome.intents.is_empty());
        assert_eq!(router.owned_orders(), 0);
    }

    #[test]
    fn test_restart_strategy_and_reject_duplicates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = StrategyRouter::new("acc1");
        assert!(router.register(Scripted::boxed("s1", &[], Behaviour::FailOnTick, &log)));
        assert!(!router.register(Scripted::boxed("s1", &[], Behaviour::Quiet, &log)));

        router.dispatch_market_data(&tick("rb2501"));
        assert!(!router.strategies()[0].active);

        assert!(router.set_active("s1", true));
        let info = &router.strategies()[0];
        assert!(info.active);
        assert!(info.last_error.is_none());
        assert!(!router.set_active("missing", true));
    }

    #[test]
    fn test_cancel_only_owned_orders() {
        let mut ownership = OwnershipTable::default();
        let mut allocator = OrderIdAllocator::new("acc1");
        let mut intents = Vec::new();
        ownership.record("o-1", "s1");
        ownership.record("o-2", "s2");

        let mut ctx = StrategyContext::new("s1", &mut ownership, &mut allocator, &mut intents);
        assert!(ctx.owns("o-1"));
        assert!(ctx.cancel_order("o-1").is_ok());
        assert!(matches!(
            ctx.cancel_order("o-2"),
            Err(StrategyError::NotOwner { .. })
        ));
        drop(ctx);
        assert_eq!(intents.len(), 1);
    }

    #[test]
    fn test_context_submit_records_owner_before_returning() {
        let mut ownership = OwnershipTable::default();
        let mut allocator = OrderIdAllocator::new("acc1");
        let mut intents = Vec::new();

        let mut ctx = StrategyContext::new("s1", &mut ownership, &mut allocator, &mut intents);
        let order_id = ctx.submit_order(OrderRequest::market("rb2501", Direction::Buy, 1));
        assert!(ctx.owns(&order_id));
        assert_eq!(ctx.into_submitted(), vec![order_id.clone()]);

        assert_eq!(ownership.owner_of(&order_id), Some("s1"));
        assert_eq!(
            intents,
            vec![OrderIntent::Submit {
                order_id: order_id.clone(),
                strategy_id: "s1".into(),
                request: OrderRequest::market("rb2501", Direction::Buy, 1),
            }]
        );

        // The router entry point shares the allocator sequence.
        let next = record_submission(
            &mut ownership,
            &mut allocator,
            "s2",
            &OrderRequest::market("rb2501", Direction::Sell, 1),
        );
        assert_ne!(next, order_id);
        assert_eq!(ownership.owner_of(&next), Some("s2"));
    }

    #[test]
    fn test_manual_submit_records_owner_and_ids_are_unique() {
        let mut router = StrategyRouter::new("acc1");
        let req = OrderRequest::market("rb2501", Direction::Buy, 1);
        let a = router.on_order_submit("s1", &req);
        let b = router.allocate_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("acc1-"));
        assert_eq!(router.owner_of(&a), Some("s1"));
        assert_eq!(router.owner_of(&b), None);
    }
}
