//! trellis: a length-framed binary RPC substrate over TCP.
//!
//! The crate provides the two halves of a peer-to-peer wire layer. A
//! [`Client`] pools outbound connections to one peer — circuit breaker
//! with exponential reconnect backoff, a nonce-correlated in-flight
//! table, and 64 KiB writer backpressure on a shared outbound buffer. A
//! [`Server`] accepts inbound connections, frames packets, and hands
//! each one to a [`PacketHandler`] capability. Payload semantics stay
//! with the node; this crate only moves frames.
//!
//! Every frame is a fixed 10-byte little-endian header (`len`, `nonce`,
//! `op`, `tag`) followed by `len` body bytes, capped at 1 MiB. Responses
//! are demultiplexed by nonce; there is no ordering guarantee between
//! nonces and no request affinity across pooled connections.

#![warn(missing_docs)]

pub mod address;
pub mod breaker;
pub mod client;
pub mod constants;
pub mod error;
pub mod packet;
pub mod rpc;
pub mod server;

mod frame;
mod socket;

pub use address::PeerAddr;
pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{Client, ClientConfig, Writer};
pub use error::{AddrParseError, NetError, WireError};
pub use packet::{Header, Op, Tag};
pub use rpc::{PendingRequest, ResponseFrame, RpcTable};
pub use server::{PacketHandler, Server, ServerConnection};
