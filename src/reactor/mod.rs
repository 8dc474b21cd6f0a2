//! Reaction submitter: sends `pong(pingTxHash)` for a newly admitted ping and
//! records it as pending.

pub mod nonce;

pub use nonce::{NonceAllocator, NonceLease};

use crate::ledger::SharedLedger;
use crate::limiter::RateLimiter;
use crate::onchain::{ChainClient, ChainError, SourceEvent};
use crate::reconcile::FeePolicy;
use crate::store::{PendingEntry, StoreError};

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Submitter {
    chain: Arc<dyn ChainClient>,
    limiter: Arc<RateLimiter>,
    nonces: Arc<NonceAllocator>,
    ledger: SharedLedger,
    fees: FeePolicy,
}

impl Submitter {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        limiter: Arc<RateLimiter>,
        nonces: Arc<NonceAllocator>,
        ledger: SharedLedger,
        fees: FeePolicy,
    ) -> Self {
        Self {
            chain,
            limiter,
            nonces,
            ledger,
            fees,
        }
    }

    /// Submit the reaction for `event` and persist it as a new pending entry
    /// with zero attempts.
    ///
    /// Callers must make sure no other submission for the same position runs
    /// concurrently.
    pub async fn submit(&self, event: &SourceEvent) -> Result<PendingEntry, ReactorError> {
        let estimate = match self.limiter.schedule(self.chain.fee_estimate()).await {
            Ok(fees) => Some(fees),
            Err(e) => {
                warn!(error = %e, "fee estimate unavailable, using floor fees");
                None
            }
        };
        let fees = self.fees.initial(estimate);

        let lease = self.nonces.reserve().await?;
        let nonce = lease.nonce();
        let pong_hash = self
            .limiter
            .schedule(self.chain.send_reaction(event.tx_hash, nonce, fees))
            .await?;
        lease.commit();

        let entry = PendingEntry::new(event, pong_hash, nonce, fees, Utc::now());
        let added = self
            .ledger
            .lock()
            .await
            .add_pending(entry.clone())
            .inspect_err(|e| {
                // The pong is out but untracked; the reconciler will never
                // see it.
                error!(
                    error = %e,
                    pong = %pong_hash,
                    nonce,
                    position = %event.position,
                    "failed to persist pending entry for broadcast pong"
                );
            })?;
        if !added {
            warn!(position = %event.position, "pending entry already present for position");
        }

        info!(
            ping = %event.tx_hash,
            pong = %pong_hash,
            nonce,
            position = %event.position,
            max_fee = fees.max_fee_per_gas,
            "pong submitted"
        );
        Ok(entry)
    }
}
