//! Bridge attach protocol between the gateway and peer nodes.

pub mod protocol;
pub mod server;

pub use protocol::{BridgeFrame, FrameBody, NodeCapability, SeqTracker};
pub use server::{BridgeInbound, BridgeServer, BridgeSessionInfo};
