//! Trading engine for one account.
//!
//! A single task owns the gateway session, the risk gate, the strategy
//! router and the telemetry caches. Control requests reach it through an
//! [`EngineHandle`]; broker events arrive on the gateway's event channel.
//! Strategy intents are executed after the callback that produced them
//! returns, and the events they cause are dispatched in arrival order.

use super::gateway::{Gateway, GatewayEvent};
use super::risk::RiskGate;
use super::router::{DispatchOutcome, StrategyFailure, StrategyRouter};
use super::server::{PushHandle, RequestHandler};
use super::strategy::OrderIntent;
use crate::ipc::{ControlRequest, MessageType, ResponseBody, StrategyCommand, TraderStatus};
use crate::models::{
    AccountData, AlarmData, AlarmSeverity, AlarmSource, OrderData, OrderRequest, OrderStatus,
    PositionData,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const REQUEST_QUEUE: usize = 64;

struct EngineCommand {
    request: ControlRequest,
    reply: oneshot::Sender<ResponseBody>,
}

/// Cloneable front door to a running [`TradingEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// A handle plus the request stream to give the engine.
    pub fn channel() -> (Self, EngineRequests) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        (Self { tx }, EngineRequests(rx))
    }
}

/// Receiving end of an [`EngineHandle`].
pub struct EngineRequests(mpsc::Receiver<EngineCommand>);

#[async_trait]
impl RequestHandler for EngineHandle {
    async fn handle(&self, request: ControlRequest) -> ResponseBody {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineCommand { request, reply }).await.is_err() {
            return ResponseBody::error("engine stopped");
        }
        rx.await
            .unwrap_or_else(|_| ResponseBody::error("engine stopped"))
    }
}

enum Work {
    Event(GatewayEvent),
    Intent(OrderIntent),
}

pub struct TradingEngine {
    account_id: String,
    started_at: DateTime<Utc>,
    gateway: Arc<dyn Gateway>,
    risk: Box<dyn RiskGate>,
    router: StrategyRouter,
    push: PushHandle,
    requests: mpsc::Receiver<EngineCommand>,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    orders: HashMap<String, OrderData>,
    positions: BTreeMap<String, PositionData>,
    account: Option<AccountData>,
    account_push_interval: Duration,
}

impl TradingEngine {
    pub fn new(
        account_id: &str,
        gateway: Arc<dyn Gateway>,
        risk: Box<dyn RiskGate>,
        router: StrategyRouter,
        push: PushHandle,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
        requests: EngineRequests,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            started_at: Utc::now(),
            gateway,
            risk,
            router,
            push,
            requests: requests.0,
            events,
            orders: HashMap::new(),
            positions: BTreeMap::new(),
            account: None,
            account_push_interval: Duration::from_secs(5),
        }
    }

    pub fn with_account_push_interval(mut self, interval: Duration) -> Self {
        self.account_push_interval = interval.max(Duration::from_millis(100));
        self
    }

    /// Run until a `stop_req` is answered, every handle is dropped or
    /// `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(account_id = %self.account_id, "Trading engine starting");

        match self.gateway.connect().await {
            Ok(()) => {
                let symbols = self.router.symbols();
                if !symbols.is_empty() {
                    if let Err(e) = self.gateway.subscribe(&symbols).await {
                        warn!(account_id = %self.account_id, error = %e, "Market data subscription failed");
                    }
                }
            }
            Err(e) => {
                error!(account_id = %self.account_id, error = %e, "Gateway connect failed");
                let alarm = AlarmData::new(
                    &self.account_id,
                    AlarmSource::Trader,
                    AlarmSeverity::Error,
                    "Gateway connect failed",
                )
                .with_detail(e.to_string());
                self.push.push(MessageType::Alarm, &alarm).await;
            }
        }

        let mut account_timer = tokio::time::interval(self.account_push_interval);
        account_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                cmd = self.requests.recv() => {
                    let Some(EngineCommand { request, reply }) = cmd else {
                        break;
                    };
                    let stop = request == ControlRequest::Stop;
                    let body = self.handle_request(request).await;
                    if reply.send(body).is_err() {
                        debug!(account_id = %self.account_id, "Requester went away");
                    }
                    if stop {
                        break;
                    }
                }
                Some(event) = self.events.recv() => {
                    self.process(Work::Event(event)).await;
                }
                _ = account_timer.tick() => {
                    self.refresh_account().await;
                }
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            account_id = %self.account_id,
            open_orders = self.orders.len(),
            "Trading engine stopped"
        );
    }

    async fn handle_request(&mut self, request: ControlRequest) -> ResponseBody {
        match request {
            ControlRequest::PlaceOrder(order) => {
                let order_id = self.router.allocate_order_id();
                info!(
                    account_id = %self.account_id,
                    %order_id,
                    symbol = %order.symbol,
                    direction = ?order.direction,
                    volume = order.volume,
                    "Manual order"
                );
                match self.submit(&order_id, None, order).await {
                    Ok(()) => ResponseBody::success(json!({ "order_id": order_id })),
                    Err(rejected) => {
                        let reason = rejected.status_msg.clone();
                        self.process(Work::Event(GatewayEvent::Order(rejected))).await;
                        ResponseBody::error(reason)
                    }
                }
            }
            ControlRequest::CancelOrder(cancel) => match self.cancel(&cancel.order_id).await {
                Ok(()) => ResponseBody::success(json!({ "order_id": cancel.order_id })),
                Err(reason) => ResponseBody::error(reason),
            },
            ControlRequest::Status => json_response(&self.status()),
            ControlRequest::Stop => {
                info!(account_id = %self.account_id, "Stop acknowledged");
                ResponseBody::success(Value::Null)
            }
            ControlRequest::Strategy(cmd) => self.handle_strategy(cmd),
        }
    }

    fn handle_strategy(&mut self, cmd: StrategyCommand) -> ResponseBody {
        let (strategy_id, active) = match cmd {
            StrategyCommand::List => return json_response(&self.router.strategies()),
            StrategyCommand::Start { strategy_id } => (strategy_id, true),
            StrategyCommand::Stop { strategy_id } => (strategy_id, false),
        };
        if self.router.set_active(&strategy_id, active) {
            ResponseBody::success(json!({ "strategy_id": strategy_id, "active": active }))
        } else {
            ResponseBody::error(format!("unknown strategy {strategy_id}"))
        }
    }

    fn status(&self) -> TraderStatus {
        TraderStatus {
            account_id: self.account_id.clone(),
            pid: std::process::id(),
            started_at: self.started_at,
            gateway_connected: self.gateway.is_connected(),
            account: self.account.clone(),
            positions: self.positions.values().cloned().collect(),
            active_orders: self.orders.len(),
            strategies: self.router.strategies(),
        }
    }

    /// Risk-check and send one order. A refused order comes back as a
    /// rejected [`OrderData`] for the caller to dispatch.
    async fn submit(
        &mut self,
        order_id: &str,
        strategy_id: Option<String>,
        request: OrderRequest,
    ) -> Result<(), OrderData> {
        let refused = match self.risk.check_order(&request) {
            Err(e) => Some(e.to_string()),
            Ok(()) => self
                .gateway
                .send_order(order_id, &request)
                .await
                .err()
                .map(|e| e.to_string()),
        };
        let Some(reason) = refused else {
            return Ok(());
        };

        warn!(account_id = %self.account_id, %order_id, %reason, "Order rejected before reaching broker");
        let mut order = OrderData::from_request(order_id, &self.account_id, &request);
        order.status = OrderStatus::Rejected;
        order.status_msg = reason;
        order.strategy_id = strategy_id;
        Err(order)
    }

    async fn cancel(&mut self, order_id: &str) -> Result<(), String> {
        self.risk
            .check_cancel(order_id)
            .map_err(|e| e.to_string())?;
        self.gateway
            .cancel_order(order_id)
            .await
            .map_err(|e| e.to_string())
    }

    /// Apply an event and everything it causes, breadth first.
    async fn process(&mut self, first: Work) {
        let mut queue = VecDeque::from([first]);
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Event(event) => {
                    let outcome = self.apply_event(event).await;
                    for failure in outcome.failures {
                        self.report_failure(failure).await;
                    }
                    queue.extend(outcome.intents.into_iter().map(Work::Intent));
                }
                Work::Intent(OrderIntent::Submit {
                    order_id,
                    strategy_id,
                    request,
                }) => {
                    if let Err(rejected) = self.submit(&order_id, Some(strategy_id), request).await {
                        queue.push_back(Work::Event(GatewayEvent::Order(rejected)));
                    }
                }
                Work::Intent(OrderIntent::Cancel {
                    order_id,
                    strategy_id,
                }) => {
                    if let Err(reason) = self.cancel(&order_id).await {
                        warn!(%order_id, %strategy_id, %reason, "Strategy cancel failed");
                    }
                }
            }
        }
    }

    async fn apply_event(&mut self, event: GatewayEvent) -> DispatchOutcome {
        match event {
            GatewayEvent::Tick(tick) => {
                self.push.push(MessageType::Tick, &tick).await;
                self.router.dispatch_market_data(&tick)
            }
            GatewayEvent::Order(mut order) => {
                if order.strategy_id.is_none() {
                    order.strategy_id = self.router.owner_of(&order.order_id).map(str::to_string);
                }
                if order.is_terminal() {
                    self.orders.remove(&order.order_id);
                } else {
                    self.orders.insert(order.order_id.clone(), order.clone());
                }
                self.push.push(MessageType::Order, &order).await;
                self.router.dispatch_order_event(&order)
            }
            GatewayEvent::Trade(trade) => {
                info!(
                    account_id = %self.account_id,
                    trade_id = %trade.trade_id,
                    order_id = %trade.order_id,
                    symbol = %trade.symbol,
                    price = %trade.price,
                    volume = trade.volume,
                    "Trade"
                );
                self.push.push(MessageType::Trade, &trade).await;
                self.router.dispatch_trade_event(&trade)
            }
            GatewayEvent::Position(position) => {
                self.positions
                    .insert(position.symbol.clone(), position.clone());
                self.push.push(MessageType::Position, &position).await;
                DispatchOutcome::default()
            }
            GatewayEvent::Account(account) => {
                self.push.push(MessageType::Account, &account).await;
                self.account = Some(account);
                DispatchOutcome::default()
            }
        }
    }

    async fn report_failure(&mut self, failure: StrategyFailure) {
        error!(
            account_id = %self.account_id,
            strategy_id = %failure.strategy_id,
            error = %failure.error,
            "Strategy disabled"
        );
        let alarm = AlarmData::new(
            &self.account_id,
            AlarmSource::Trader,
            AlarmSeverity::Error,
            format!("Strategy {} disabled", failure.strategy_id),
        )
        .with_detail(failure.error.to_string());
        self.push.push(MessageType::Alarm, &alarm).await;
    }

    async fn refresh_account(&mut self) {
        match self.gateway.query_account().await {
            Ok(account) => {
                self.push.push(MessageType::Account, &account).await;
                self.account = Some(account);
            }
            Err(e) => debug!(account_id = %self.account_id, error = %e, "Account query failed"),
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> ResponseBody {
    match serde_json::to_value(value) {
        Ok(data) => ResponseBody::success(data),
        Err(e) => ResponseBody::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, IpcConfig, RiskLimitsConfig};
    use crate::error::{GatewayError, RiskError, StrategyError};
    use crate::ipc::Channel;
    use crate::models::{Direction, TickData, TradeData};
    use crate::trader::gateway::{MockGateway, PaperGateway};
    use crate::trader::risk::{MockRiskGate, OrderLimits};
    use crate::trader::server::ChannelServer;
    use crate::trader::strategy::{Strategy, StrategyContext};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::io::duplex;

    /// Buys one lot on the first tick it sees and records order statuses.
    struct BuyOnce {
        id: String,
        symbols: Vec<String>,
        fail_on_tick: bool,
        bought: bool,
        seen: Arc<Mutex<Vec<OrderStatus>>>,
    }

    impl BuyOnce {
        fn new(id: &str) -> (Self, Arc<Mutex<Vec<OrderStatus>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let strategy = Self {
                id: id.into(),
                symbols: vec!["rb2501".into()],
                fail_on_tick: false,
                bought: false,
                seen: seen.clone(),
            };
            (strategy, seen)
        }
    }

    impl Strategy for BuyOnce {
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
            if self.fail_on_tick {
                return Err(StrategyError::Callback("bad signal".into()));
            }
            if !self.bought {
                self.bought = true;
                ctx.submit_order(OrderRequest::market(&tick.symbol, Direction::Buy, 1));
            }
            Ok(())
        }

        fn on_order(
            &mut self,
            order: &OrderData,
            _ctx: &mut StrategyContext<'_>,
        ) -> Result<(), StrategyError> {
            self.seen.lock().unwrap().push(order.status);
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

    struct Unused;

    #[async_trait]
    impl RequestHandler for Unused {
        async fn handle(&self, _request: ControlRequest) -> ResponseBody {
            ResponseBody::error("unused")
        }
    }

    /// Push handle wired to an in-memory client, register already consumed.
    async fn connected_push() -> (PushHandle, Channel) {
        let server = ChannelServer::new("acc1", &IpcConfig::default(), Arc::new(Unused));
        let (client, served) = duplex(256 * 1024);
        server.accept(served).expect("accepted");
        let mut client = Channel::new(client);
        client.receive().await.unwrap();
        (server.push_handle(), client)
    }

    fn router_with(strategy: BuyOnce) -> StrategyRouter {
        let mut router = StrategyRouter::new("acc1");
        router.register(Box::new(strategy));
        router
    }

    async fn drain(engine: &mut TradingEngine) {
        while let Ok(event) = engine.events.try_recv() {
            engine.process(Work::Event(event)).await;
        }
    }

    async fn next_of(client: &mut Channel, kind: &str) -> crate::ipc::Envelope {
        loop {
            let envelope = client.receive().await.unwrap();
            if envelope.msg_type == kind {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_strategy_order_fills_and_releases_ownership() {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(PaperGateway::new("acc1", GatewayConfig::default(), tx));
        gateway.connect().await.unwrap();
        let (strategy, seen) = BuyOnce::new("s1");
        let (push, mut client) = connected_push().await;
        let mut engine = TradingEngine::new(
            "acc1",
            gateway.clone(),
            Box::new(OrderLimits::new(RiskLimitsConfig::default())),
            router_with(strategy),
            push,
            rx,
            EngineHandle::channel().1,
        );

        gateway.on_tick(TickData::new("rb2501", dec!(3500))).await;
        drain(&mut engine).await;
        drain(&mut engine).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![OrderStatus::Pending, OrderStatus::Filled]
        );
        assert_eq!(engine.router.owned_orders(), 0);
        assert!(engine.orders.is_empty());
        assert_eq!(engine.positions["rb2501"].pos_long, 1);

        let order: OrderData = next_of(&mut client, "order").await.payload().unwrap();
        assert_eq!(order.strategy_id.as_deref(), Some("s1"));
        let trade = next_of(&mut client, "trade").await;
        assert!(trade.seq.is_some());
    }

    #[tokio::test]
    async fn test_gateway_refusal_becomes_rejected_order() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_send_order()
            .times(1)
            .returning(|_, _| Err(GatewayError::Rejected("no margin".into())));
        let (_tx, rx) = mpsc::unbounded_channel();
        let (strategy, seen) = BuyOnce::new("s1");
        let (push, mut client) = connected_push().await;
        let mut engine = TradingEngine::new(
            "acc1",
            Arc::new(gateway),
            Box::new(OrderLimits::new(RiskLimitsConfig::default())),
            router_with(strategy),
            push,
            rx,
            EngineHandle::channel().1,
        );

        let tick = TickData::new("rb2501", dec!(3500));
        engine.process(Work::Event(GatewayEvent::Tick(tick))).await;

        assert_eq!(*seen.lock().unwrap(), vec![OrderStatus::Rejected]);
        assert_eq!(engine.router.owned_orders(), 0);
        let order: OrderData = next_of(&mut client, "order").await.payload().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.status_msg.contains("no margin"));
    }

    #[tokio::test]
    async fn test_manual_order_blocked_by_risk_never_reaches_gateway() {
        let mut gateway = MockGateway::new();
        gateway.expect_send_order().never();
        let mut risk = MockRiskGate::new();
        risk.expect_check_order()
            .returning(|_| Err(RiskError::VolumeTooLarge { volume: 50, max: 10 }));
        let (_tx, rx) = mpsc::unbounded_channel();
        let (push, mut client) = connected_push().await;
        let mut engine = TradingEngine::new(
            "acc1",
            Arc::new(gateway),
            Box::new(risk),
            StrategyRouter::new("acc1"),
            push,
            rx,
            EngineHandle::channel().1,
        );

        let request = OrderRequest::limit("rb2501", Direction::Buy, 50, dec!(3500));
        let body = engine
            .handle_request(ControlRequest::PlaceOrder(request))
            .await;
        let err = body.into_result().unwrap_err();
        assert!(err.to_string().contains("exceeds limit 10"));

        let order: OrderData = next_of(&mut client, "order").await.payload().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.strategy_id, None);
    }

    #[tokio::test]
    async fn test_failing_strategy_is_disabled_with_alarm() {
        let gateway = MockGateway::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let (mut strategy, _seen) = BuyOnce::new("s1");
        strategy.fail_on_tick = true;
        let (push, mut client) = connected_push().await;
        let mut engine = TradingEngine::new(
            "acc1",
            Arc::new(gateway),
            Box::new(MockRiskGate::new()),
            router_with(strategy),
            push,
            rx,
            EngineHandle::channel().1,
        );

        let tick = TickData::new("rb2501", dec!(3500));
        engine.process(Work::Event(GatewayEvent::Tick(tick))).await;

        let alarm: AlarmData = next_of(&mut client, "alarm").await.payload().unwrap();
        assert_eq!(alarm.source, AlarmSource::Trader);
        assert!(alarm.title.contains("s1"));
        let info = &engine.router.strategies()[0];
        assert!(!info.active);
        assert!(info.last_error.is_some());
    }

    #[tokio::test]
    async fn test_status_and_strategy_commands() {
        let mut gateway = MockGateway::new();
        gateway.expect_is_connected().return_const(true);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (strategy, _seen) = BuyOnce::new("s1");
        let (push, _client) = connected_push().await;
        let mut engine = TradingEngine::new(
            "acc1",
            Arc::new(gateway),
            Box::new(MockRiskGate::new()),
            router_with(strategy),
            push,
            rx,
            EngineHandle::channel().1,
        );

        let stop = StrategyCommand::Stop {
            strategy_id: "s1".into(),
        };
        assert!(engine
            .handle_request(ControlRequest::Strategy(stop))
            .await
            .into_result()
            .is_ok());
        let unknown = StrategyCommand::Start {
            strategy_id: "nope".into(),
        };
        assert!(engine
            .handle_request(ControlRequest::Strategy(unknown))
            .await
            .into_result()
            .is_err());

        let data = engine
            .handle_request(ControlRequest::Status)
            .await
            .into_result()
            .unwrap();
        let status: TraderStatus = serde_json::from_value(data).unwrap();
        assert_eq!(status.account_id, "acc1");
        assert_eq!(status.pid, std::process::id());
        assert!(status.gateway_connected);
        assert!(!status.strategies[0].active);
    }

    #[tokio::test]
    async fn test_stop_request_ends_run_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(PaperGateway::new("acc1", GatewayConfig::default(), tx));
        let (strategy, _seen) = BuyOnce::new("s1");
        let (push, _client) = connected_push().await;
        let (handle, requests) = EngineHandle::channel();
        let engine = TradingEngine::new(
            "acc1",
            gateway.clone(),
            Box::new(OrderLimits::new(RiskLimitsConfig::default())),
            router_with(strategy),
            push,
            rx,
            requests,
        );
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let running = tokio::spawn(engine.run(shutdown));

        let body = handle.handle(ControlRequest::Status).await;
        assert!(body.into_result().is_ok());
        assert_eq!(gateway.subscribed().await, vec!["rb2501".to_string()]);

        let body = handle.handle(ControlRequest::Stop).await;
        assert!(body.into_result().is_ok());
        running.await.unwrap();

        let body = handle.handle(ControlRequest::Status).await;
        assert!(body.into_result().is_err());
    }
}
