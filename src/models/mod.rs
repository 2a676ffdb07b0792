//! Trading data model shared by both sides of the channel.

mod types;

pub use types::*;
