//! Trading payloads carried inside envelopes.
//!
//! These are the data contract between execution processes, the control
//! process and strategies. Prices and money are `Decimal`, volumes are
//! whole contracts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

/// Open or close a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Offset {
    #[default]
    Open,
    Close,
    #[serde(rename = "CLOSETODAY")]
    CloseToday,
    #[serde(rename = "CLOSEYESTERDAY")]
    CloseYesterday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Filled, cancelled and rejected orders never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Order placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    #[serde(default)]
    pub offset: Offset,
    pub volume: u32,
    /// `None` means market order.
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub order_type: OrderType,
}

impl OrderRequest {
    pub fn limit(symbol: &str, direction: Direction, volume: u32, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            offset: Offset::Open,
            volume,
            price: Some(price),
            order_type: OrderType::Limit,
        }
    }

    pub fn market(symbol: &str, direction: Direction, volume: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            offset: Offset::Open,
            volume,
            price: None,
            order_type: OrderType::Market,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub order_id: String,
}

/// Order state as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderData {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    #[serde(default)]
    pub offset: Offset,
    pub volume: u32,
    #[serde(default)]
    pub traded: u32,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(default)]
    pub status_msg: String,
    /// Strategy that placed the order, if any.
    #[serde(default)]
    pub strategy_id: Option<String>,
    pub update_time: DateTime<Utc>,
}

impl OrderData {
    /// Build a pending order from a request.
    pub fn from_request(order_id: &str, account_id: &str, req: &OrderRequest) -> Self {
        Self {
            order_id: order_id.to_string(),
            account_id: account_id.to_string(),
            symbol: req.symbol.clone(),
            direction: req.direction,
            offset: req.offset,
            volume: req.volume,
            traded: 0,
            price: req.price,
            order_type: req.order_type,
            status: OrderStatus::Pending,
            status_msg: String::new(),
            strategy_id: None,
            update_time: Utc::now(),
        }
    }

    pub fn volume_left(&self) -> u32 {
        self.volume.saturating_sub(self.traded)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub trade_id: String,
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub direction: Direction,
    #[serde(default)]
    pub offset: Offset,
    pub price: Decimal,
    pub volume: u32,
    #[serde(default)]
    pub commission: Decimal,
    pub trade_time: DateTime<Utc>,
}

/// Net and per-side holdings for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionData {
    pub account_id: String,
    pub symbol: String,
    pub pos_long: u32,
    pub pos_short: u32,
    #[serde(default)]
    pub open_price_long: Option<Decimal>,
    #[serde(default)]
    pub open_price_short: Option<Decimal>,
    #[serde(default)]
    pub float_profit: Decimal,
}

impl PositionData {
    pub fn flat(account_id: &str, symbol: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            pos_long: 0,
            pos_short: 0,
            open_price_long: None,
            open_price_short: None,
            float_profit: Decimal::ZERO,
        }
    }

    /// Long minus short.
    pub fn net(&self) -> i64 {
        i64::from(self.pos_long) - i64::from(self.pos_short)
    }
}

/// Account equity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountData {
    pub account_id: String,
    pub balance: Decimal,
    pub available: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub float_profit: Decimal,
    #[serde(default)]
    pub gateway_connected: bool,
    #[serde(default)]
    pub trade_paused: bool,
    pub update_time: DateTime<Utc>,
}

/// Market data tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    pub symbol: String,
    pub last_price: Decimal,
    #[serde(default)]
    pub bid_price: Option<Decimal>,
    #[serde(default)]
    pub ask_price: Option<Decimal>,
    #[serde(default)]
    pub volume: u64,
    pub datetime: DateTime<Utc>,
}

impl TickData {
    pub fn new(symbol: &str, last_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_price,
            bid_price: None,
            ask_price: None,
            volume: 0,
            datetime: Utc::now(),
        }
    }
}

/// Severity levels for alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlarmSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Info => "INFO",
            AlarmSeverity::Warning => "WARNING",
            AlarmSeverity::Error => "ERROR",
            AlarmSeverity::Critical => "CRITICAL",
        }
    }
}

/// Where an alarm was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmSource {
    Trader,
    Manager,
}

/// An operator-facing alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmData {
    pub alarm_id: String,
    pub account_id: String,
    pub source: AlarmSource,
    pub severity: AlarmSeverity,
    pub title: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlarmData {
    pub fn new(
        account_id: &str,
        source: AlarmSource,
        severity: AlarmSeverity,
        title: impl Into<String>,
    ) -> Self {
        Self {
            alarm_id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            source,
            severity,
            title: title.into(),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
