//! Interprocess messaging between the control process and execution processes.
//!
//! - `codec`: length-prefixed JSON frames and the envelope type catalog
//! - `channel`: framed duplex channel with backpressure and shared close
//! - `message`: typed request, response and registration payloads

pub mod channel;
pub mod codec;
mod message;

pub use channel::{Channel, ChannelReceiver, ChannelSender, IpcStream};
pub use codec::{decode, encode, write_frame, Envelope, MessageType, MAX_FRAME_LEN};
pub use message::*;

/// Socket file name for one account inside the socket directory.
pub fn socket_file_name(account_id: &str) -> String {
    format!("qtrader_{}.sock", account_id)
}
