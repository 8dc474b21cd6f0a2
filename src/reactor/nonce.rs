//! Fresh nonce allocation.
//!
//! Every transaction that opens a new nonce (a first pong, or the retry of a
//! reverted one) reserves it here. The reservation holds the allocator until
//! the send has been accepted or abandoned, so two senders can never be
//! handed the same nonce. Replacements at an existing nonce (speed-ups,
//! cancels) do not go through the allocator.

use crate::limiter::RateLimiter;
use crate::onchain::{ChainClient, ChainError};

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct NonceAllocator {
    chain: Arc<dyn ChainClient>,
    limiter: Arc<RateLimiter>,
    /// One past the last nonce the node accepted from us.
    next: Mutex<Option<u64>>,
}

/// A reserved nonce. Dropping it without `commit` leaves the allocator as it
/// was.
pub struct NonceLease<'a> {
    next: MutexGuard<'a, Option<u64>>,
    nonce: u64,
}

impl NonceAllocator {
    pub fn new(chain: Arc<dyn ChainClient>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            chain,
            limiter,
            next: Mutex::new(None),
        }
    }

    /// Reserve the next nonce: the node's pending count, or our own count if
    /// the node has not caught up with our last send yet.
    pub async fn reserve(&self) -> Result<NonceLease<'_>, ChainError> {
        let next = self.next.lock().await;
        let pending = self.limiter.schedule(self.chain.pending_nonce()).await?;
        let nonce = next.map_or(pending, |local| local.max(pending));
        if nonce != pending {
            debug!(pending, nonce, "node pending nonce behind local count");
        }
        Ok(NonceLease { next, nonce })
    }
}

impl NonceLease<'_> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The transaction at this nonce was accepted.
    pub fn commit(mut self) {
        *self.next = Some(self.nonce + 1);
    }
}
