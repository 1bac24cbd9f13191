//! Cross-cluster federation: the wire protocol (§4.8), the inbound server
//! (§4.7's six unary RPCs plus the `PeerChannel` upgrade), and the outbound
//! client each peer connection uses to reach them.

pub mod client;
pub mod messages;
pub mod server;

pub use client::FederationClient;
pub use messages::PeerFrame;
pub use server::{build_router, FederationState, InboundFrameSink};
