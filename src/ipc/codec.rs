//! Length-prefixed JSON framing.
//!
//! Every frame is a 4-byte big-endian body length followed by one JSON
//! envelope. Decoding suspends until a whole frame is available.

use crate::error::IpcError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Closed catalog of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    Heartbeat,
    Account,
    Position,
    Order,
    Trade,
    Tick,
    Alarm,
    /// Produced inside the control process from supervisor state.
    SystemStatus,
    OrderReq,
    CancelReq,
    StatusReq,
    StopReq,
    StrategyReq,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Account => "account",
            MessageType::Position => "position",
            MessageType::Order => "order",
            MessageType::Trade => "trade",
            MessageType::Tick => "tick",
            MessageType::Alarm => "alarm",
            MessageType::SystemStatus => "system_status",
            MessageType::OrderReq => "order_req",
            MessageType::CancelReq => "cancel_req",
            MessageType::StatusReq => "status_req",
            MessageType::StopReq => "stop_req",
            MessageType::StrategyReq => "strategy_req",
            MessageType::Response => "response",
        }
    }

    /// Control-to-execution commands that expect a `response`.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::OrderReq
                | MessageType::CancelReq
                | MessageType::StatusReq
                | MessageType::StopReq
                | MessageType::StrategyReq
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "register" => MessageType::Register,
            "heartbeat" => MessageType::Heartbeat,
            "account" => MessageType::Account,
            "position" => MessageType::Position,
            "order" => MessageType::Order,
            "trade" => MessageType::Trade,
            "tick" => MessageType::Tick,
            "alarm" => MessageType::Alarm,
            "system_status" => MessageType::SystemStatus,
            "order_req" => MessageType::OrderReq,
            "cancel_req" => MessageType::CancelReq,
            "status_req" => MessageType::StatusReq,
            "stop_req" => MessageType::StopReq,
            "strategy_req" => MessageType::StrategyReq,
            "response" => MessageType::Response,
            other => return Err(IpcError::UnknownMessageType(other.to_string())),
        };
        Ok(kind)
    }
}

/// The unit exchanged over a channel.
///
/// `type` stays a raw string on the wire so that an unknown kind still
/// decodes; callers resolve it with [`Envelope::kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub account_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Per-connection push sequence, used to drop duplicate deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Envelope {
    pub fn new(kind: MessageType, account_id: &str, data: Value) -> Self {
        Self {
            msg_type: kind.as_str().to_string(),
            account_id: account_id.to_string(),
            data,
            request_id: None,
            seq: None,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        account_id: &str,
        payload: &T,
    ) -> Result<Self, IpcError> {
        Ok(Self::new(kind, account_id, serde_json::to_value(payload)?))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Resolve the raw type string against the catalog.
    pub fn kind(&self) -> Result<MessageType, IpcError> {
        self.msg_type.parse()
    }

    /// Deserialize `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// Serialize an envelope into a single length-prefixed frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::Framing(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read exactly one envelope.
///
/// A clean end of stream on a frame boundary is `ChannelClosed`; anything
/// cut short inside a frame is a framing error. Not cancellation safe: a
/// dropped future may leave the reader mid-frame.
pub async fn decode<R>(reader: &mut R) -> Result<Envelope, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(io_to_ipc)?;
        if n == 0 {
            if filled == 0 {
                return Err(IpcError::ChannelClosed);
            }
            return Err(IpcError::Framing(format!(
                "truncated length prefix: got {} of {} bytes",
                filled, LEN_PREFIX
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(IpcError::Framing("empty frame".to_string()));
    }
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Framing(format!(
            "declared frame length {} exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            IpcError::Framing(format!("truncated frame: expected {} bytes", len))
        } else {
            io_to_ipc(e)
        }
    })?;

    serde_json::from_slice(&body).map_err(|e| IpcError::Framing(format!("invalid JSON: {}", e)))
}

/// Encode and write one frame, flushing the writer.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await.map_err(io_to_ipc)?;
    writer.flush().await.map_err(io_to_ipc)
}

fn io_to_ipc(err: std::io::Error) -> IpcError {
    debug!(error = %err, "Channel I/O failed");
    IpcError::ChannelClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::io::Builder;

    fn heartbeat() -> Envelope {
        Envelope::new(
            MessageType::Heartbeat,
            "acc1",
            json!({"sent_at": "2025-01-02T09:30:00Z"}),
        )
    }

    #[test]
    fn test_encode_prefix_is_big_endian_body_length() {
        let frame = encode(&heartbeat()).unwrap();
        let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(body_len, frame.len() - 4);

        let body: Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(body["type"], "heartbeat");
        assert_eq!(body["account_id"], "acc1");
        assert!(body.get("request_id").is_none());
    }

    #[tokio::test]
    async fn test_decode_frame_split_across_reads() {
        let frame = encode(&heartbeat()).unwrap();
        let mut reader = Builder::new()
            .read(&frame[..2])
            .read(&frame[2..7])
            .read(&frame[7..])
            .build();

        let envelope = decode(&mut reader).await.unwrap();
        assert_eq!(envelope, heartbeat());
        assert_eq!(envelope.kind().unwrap(), MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_decode_two_frames_back_to_back() {
        let first = heartbeat();
        let second = Envelope::new(MessageType::Tick, "acc1", json!({"symbol": "rb2501"}))
            .with_seq(7);
        let mut bytes = encode(&first).unwrap();
        bytes.extend(encode(&second).unwrap());

        let mut reader = Builder::new().read(&bytes).build();
        assert_eq!(decode(&mut reader).await.unwrap(), first);
        let decoded = decode(&mut reader).await.unwrap();
        assert_eq!(decoded.seq, Some(7));
        assert!(matches!(
            decode(&mut reader).await,
            Err(IpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_decode_truncated_body_is_framing_error() {
        let frame = encode(&heartbeat()).unwrap();
        let mut reader = Builder::new().read(&frame[..frame.len() - 3]).build();

        let err = decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, IpcError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_decode_truncated_prefix_is_framing_error() {
        let mut reader = Builder::new().read(&[0, 0]).build();
        assert!(matches!(
            decode(&mut reader).await,
            Err(IpcError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_rejects_oversize_and_empty_lengths() {
        let oversize = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut reader = Builder::new().read(&oversize).build();
        assert!(matches!(
            decode(&mut reader).await,
            Err(IpcError::Framing(_))
        ));

        let mut reader = Builder::new().read(&[0, 0, 0, 0]).build();
        assert!(matches!(
            decode(&mut reader).await,
            Err(IpcError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_invalid_json_is_framing_error() {
        let body = b"{not json";
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        let mut reader = Builder::new().read(&bytes).build();

        assert!(matches!(
            decode(&mut reader).await,
            Err(IpcError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_decodes_but_does_not_resolve() {
        let envelope = Envelope {
            msg_type: "bar".to_string(),
            account_id: "acc1".to_string(),
            data: Value::Null,
            request_id: None,
            seq: None,
        };
        let frame = encode(&envelope).unwrap();
        let mut reader = Builder::new().read(&frame).build();

        let decoded = decode(&mut reader).await.unwrap();
        assert!(matches!(
            decoded.kind(),
            Err(IpcError::UnknownMessageType(t)) if t == "bar"
        ));
    }

    #[tokio::test]
    async fn test_write_frame_writes_encoded_bytes() {
        let envelope = heartbeat().with_request_id("req-1");
        let expected = encode(&envelope).unwrap();
        let mut writer = Builder::new().write(&expected).build();

        write_frame(&mut writer, &envelope).await.unwrap();
    }

    #[test]
    fn test_message_type_names_round_trip() {
        for kind in [
            MessageType::Register,
            MessageType::Account,
            MessageType::SystemStatus,
            MessageType::StrategyReq,
            MessageType::Response,
        ] {
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
        assert!(MessageType::CancelReq.is_request());
        assert!(!MessageType::Trade.is_request());
    }
}
