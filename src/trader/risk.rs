//! Pre-trade risk gate.
//!
//! The engine calls the gate synchronously before every order and cancel
//! reaches the gateway.

use crate::config::RiskLimitsConfig;
use crate::error::RiskError;
use crate::models::OrderRequest;
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

#[cfg_attr(test, mockall::automock)]
pub trait RiskGate: Send {
    /// Approve an order. Approved orders count against daily limits.
    fn check_order(&mut self, request: &OrderRequest) -> Result<(), RiskError>;

    /// Approve a cancel. Approved cancels count against daily limits.
    fn check_cancel(&mut self, order_id: &str) -> Result<(), RiskError>;
}

/// Volume and daily count limits, reset at the UTC date boundary.
#[derive(Debug)]
pub struct OrderLimits {
    limits: RiskLimitsConfig,
    day: NaiveDate,
    orders_today: u32,
    cancels_today: u32,
}

impl OrderLimits {
    pub fn new(limits: RiskLimitsConfig) -> Self {
        Self {
            limits,
            day: Utc::now().date_naive(),
            orders_today: 0,
            cancels_today: 0,
        }
    }

    pub fn orders_today(&self) -> u32 {
        self.orders_today
    }

    pub fn cancels_today(&self) -> u32 {
        self.cancels_today
    }

    fn roll(&mut self, today: NaiveDate) {
        if today != self.day {
            info!(
                orders = self.orders_today,
                cancels = self.cancels_today,
                %today,
                "Daily risk counters reset"
            );
            self.day = today;
            self.orders_today = 0;
            self.cancels_today = 0;
        }
    }

    pub fn check_order_on(&mut self, request: &OrderRequest, today: NaiveDate) -> Result<(), RiskError> {
        self.roll(today);

        let result = if request.volume == 0 {
            Err(RiskError::ZeroVolume)
        } else if request.volume > self.limits.max_order_volume {
            Err(RiskError::VolumeTooLarge {
                volume: request.volume,
                max: self.limits.max_order_volume,
            })
        } else if self.orders_today >= self.limits.max_daily_orders {
            Err(RiskError::DailyOrderLimit(self.limits.max_daily_orders))
        } else {
            self.orders_today += 1;
            Ok(())
        };

        if let Err(e) = &result {
            warn!(symbol = %request.symbol, volume = request.volume, error = %e, "Order blocked by risk gate");
        }
        result
    }

    pub fn check_cancel_on(&mut self, order_id: &str, today: NaiveDate) -> Result<(), RiskError> {
        self.roll(today);

        if self.cancels_today >= self.limits.max_daily_cancels {
            let e = RiskError::DailyCancelLimit(self.limits.max_daily_cancels);
            warn!(%order_id, error = %e, "Cancel blocked by risk gate");
            return Err(e);
        }
        self.cancels_today += 1;
        Ok(())
    }
}

impl RiskGate for OrderLimits {
    fn check_order(&mut self, request: &OrderRequest) -> Result<(), RiskError> {
        self.check_order_on(request, Utc::now().date_naive())
    }

    fn check_cancel(&mut self, order_id: &str) -> Result<(), RiskError> {
        self.check_cancel_on(order_id, Utc::now().date_naive())
    }
}
