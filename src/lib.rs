//! Ping-pong bot library.
//!
//! Watches a contract for `Ping()` events over a WebSocket subscription with
//! an HTTP polling fallback, answers each one exactly once with
//! `pong(pingTxHash)`, and follows every pong until it is mined, sped up or
//! cancelled. Shared by the `pongbot` daemon and the `ping_stats` tool.

pub mod app;
pub mod config;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod limiter;
pub mod onchain;
pub mod reactor;
pub mod reconcile;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;
