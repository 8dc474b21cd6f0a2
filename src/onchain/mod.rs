//! On-chain surface of the bot: the ping-pong contract ABI, the typed
//! events and receipts that cross the chain boundary, and the client traits
//! the rest of the crate talks to.
//!
//! Architecture:
//! - `ChainClient`: request/response calls over HTTP (logs, receipts, fees,
//!   nonces, submissions). Every call is expected to go through the
//!   `RateLimiter` at the call site.
//! - `PushConnector` / `PushChannel`: the WebSocket subscription side, kept
//!   separate so the health monitor can drop and rebuild it.
//! - Raw `Log`s are decoded into `SourceEvent` right at the boundary; nothing
//!   past this module sees an untyped payload.

pub mod abi;
pub mod client;
pub mod types;

pub use client::{
    AlloyChainClient, AlloyPushConnector, ChainClient, ChainError, PushChannel, PushConnector,
    SourceEventStream,
};
pub use types::{FeeParams, Position, ReceiptStatus, SourceEvent};
