//! DSU protocol server
//!
//! This module provides the UDP side of the bridge:
//! - Packet framing and request decoding
//! - Per-client subscriptions with TTL expiry
//! - Pad-data encoding and broadcast

pub mod codec;
pub mod report;
#[allow(clippy::module_inception)]
pub mod server;
pub mod subscription;

pub use codec::{CodecError, Magic, MessageType, Packet, Request, MAX_PROTOCOL_VERSION};
pub use report::{encode_pad_data, WireSettings};
pub use server::{PadInfoProvider, ProtocolServer, ServerError};
pub use subscription::{SubscriptionRegistry, SUBSCRIPTION_TTL};
