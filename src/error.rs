//! Typed failures for the IPC, supervision and strategy layers.
//!
//! Library code returns these enums; the binary and configuration layers
//! wrap them in `anyhow` with context.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by the framing codec, channels and request correlation.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Malformed length prefix, oversize or truncated frame, or invalid JSON.
    /// The channel that produced it is torn down.
    #[error("framing error: {0}")]
    Framing(String),

    /// Peer disconnected or the channel was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// No matching response arrived before the deadline.
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout {
        request_id: String,
        timeout: Duration,
    },

    /// Envelope type outside the known catalog. Logged and dropped.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The execution process answered with `status = "error"`.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IpcError {
    /// Whether this failure means the underlying channel can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::Framing(_) | IpcError::ChannelClosed)
    }
}

/// Failures surfaced by supervisor commands.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account {account_id} cannot {action} while {state}")]
    InvalidState {
        account_id: String,
        action: &'static str,
        state: String,
    },

    #[error("failed to spawn execution process for {account_id}: {reason}")]
    Spawn { account_id: String, reason: String },

    /// The supervisor task has already shut down.
    #[error("supervisor is no longer running")]
    SupervisorGone,

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// A strategy callback that returned an error or panicked.
#[derive(Debug, Clone, Error)]
pub enum StrategyError {
    #[error("strategy callback failed: {0}")]
    Callback(String),

    #[error("strategy callback panicked: {0}")]
    Panicked(String),

    /// The strategy tried to act on an order it does not own.
    #[error("order {order_id} is not owned by strategy {strategy_id}")]
    NotOwner {
        order_id: String,
        strategy_id: String,
    },
}

/// Failures reported by a brokerage gateway adapter.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

/// Pre-trade checks that refused an order or cancel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RiskError {
    #[error("order volume must be positive")]
    ZeroVolume,

    #[error("order volume {volume} exceeds limit {max}")]
    VolumeTooLarge { volume: u32, max: u32 },

    #[error("daily order limit {0} reached")]
    DailyOrderLimit(u32),

    #[error("daily cancel limit {0} reached")]
    DailyCancelLimit(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(IpcError::ChannelClosed.is_fatal());
        assert!(IpcError::Framing("bad length".into()).is_fatal());
        assert!(!IpcError::UnknownMessageType("bar".into()).is_fatal());
        assert!(!IpcError::RequestTimeout {
            request_id: "r1".into(),
            timeout: Duration::from_secs(1),
        }
        .is_fatal());
    }

    #[test]
    fn test_control_error_wraps_ipc() {
        let err: ControlError = IpcError::ChannelClosed.into();
        assert!(matches!(err, ControlError::Ipc(IpcError::ChannelClosed)));
        assert_eq!(err.to_string(), "channel closed");
    }
}
