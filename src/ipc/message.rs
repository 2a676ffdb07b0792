//! Typed payloads for the control protocol.
//!
//! The envelope `type` decides which of these lives in `data`.

use super::codec::{Envelope, MessageType};
use crate::error::IpcError;
use crate::models::{AccountData, CancelRequest, OrderRequest, PositionData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands the control process sends to an execution process.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    PlaceOrder(OrderRequest),
    CancelOrder(CancelRequest),
    Status,
    /// Graceful shutdown.
    Stop,
    Strategy(StrategyCommand),
}

impl ControlRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlRequest::PlaceOrder(_) => MessageType::OrderReq,
            ControlRequest::CancelOrder(_) => MessageType::CancelReq,
            ControlRequest::Status => MessageType::StatusReq,
            ControlRequest::Stop => MessageType::StopReq,
            ControlRequest::Strategy(_) => MessageType::StrategyReq,
        }
    }

    /// Build the request envelope for one account.
    pub fn to_envelope(&self, account_id: &str, request_id: &str) -> Result<Envelope, IpcError> {
        let data = match self {
            ControlRequest::PlaceOrder(req) => serde_json::to_value(req)?,
            ControlRequest::CancelOrder(req) => serde_json::to_value(req)?,
            ControlRequest::Status | ControlRequest::Stop => Value::Object(Default::default()),
            ControlRequest::Strategy(cmd) => serde_json::to_value(cmd)?,
        };
        Ok(Envelope::new(self.message_type(), account_id, data).with_request_id(request_id))
    }

    /// Parse a received request envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, IpcError> {
        let request = match envelope.kind()? {
            MessageType::OrderReq => ControlRequest::PlaceOrder(envelope.payload()?),
            MessageType::CancelReq => ControlRequest::CancelOrder(envelope.payload()?),
            MessageType::StatusReq => ControlRequest::Status,
            MessageType::StopReq => ControlRequest::Stop,
            MessageType::StrategyReq => ControlRequest::Strategy(envelope.payload()?),
            other => return Err(IpcError::UnknownMessageType(other.to_string())),
        };
        Ok(request)
    }
}

/// Strategy management actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StrategyCommand {
    List,
    Start { strategy_id: String },
    Stop { strategy_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// `data` of a `response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub message: String,
}

impl ResponseBody {
    pub fn success(data: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            data,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: Value::Null,
            message: message.into(),
        }
    }

    /// Build the response envelope answering `request_id`.
    pub fn to_envelope(&self, account_id: &str, request_id: &str) -> Result<Envelope, IpcError> {
        Ok(Envelope::with_payload(MessageType::Response, account_id, self)?
            .with_request_id(request_id))
    }

    /// Success data, or `Remote` carrying the error message.
    pub fn into_result(self) -> Result<Value, IpcError> {
        match self.status {
            ResponseStatus::Success => Ok(self.data),
            ResponseStatus::Error => Err(IpcError::Remote(self.message)),
        }
    }
}

/// Sent once by the execution process on every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub sent_at: DateTime<Utc>,
}

/// One strategy as reported by `strategy_req` and `status_req`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub strategy_id: String,
    pub active: bool,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub owned_orders: usize,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Reply to `status_req`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderStatus {
    pub account_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub gateway_connected: bool,
    pub account: Option<AccountData>,
    pub positions: Vec<PositionData>,
    pub active_orders: usize,
    pub strategies: Vec<StrategyInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use rust_decimal_macros::dec;

    #[test]
    fn test_request_envelope_carries_type_and_id() {
        let req = ControlRequest::PlaceOrder(OrderRequest::limit(
            "rb2501",
            Direction::Buy,
            1,
            dec!(3500),
        ));
        let envelope = req.to_envelope("acc1", "req-9").unwrap();
        assert_eq!(envelope.msg_type, "order_req");
        assert_eq!(envelope.request_id.as_deref(), Some("req-9"));
        assert_eq!(ControlRequest::from_envelope(&envelope).unwrap(), req);
    }

    #[test]
    fn test_strategy_command_wire_shape() {
        let cmd = StrategyCommand::Stop {
            strategy_id: "rsi_1".into(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], "stop");
        assert_eq!(value["strategy_id"], "rsi_1");
    }

    #[test]
    fn test_non_request_envelope_is_rejected() {
        let envelope = Envelope::new(MessageType::Trade, "acc1", Value::Null);
        assert!(matches!(
            ControlRequest::from_envelope(&envelope),
            Err(IpcError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_error_response_maps_to_remote() {
        let body = ResponseBody::error("order not found");
        let envelope = body.to_envelope("acc1", "req-1").unwrap();
        assert_eq!(envelope.data["status"], "error");

        let parsed: ResponseBody = envelope.payload().unwrap();
        assert!(matches!(
            parsed.into_result(),
            Err(IpcError::Remote(msg)) if msg == "order not found"
        ));
    }
}
