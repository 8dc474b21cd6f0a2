//! Pending transaction reconciler.
//!
//! Each sweep walks the pending entries in ascending position order and
//! drives every one of them one step through its lifecycle:
//!
//! ```text
//!   receipt ok        → confirm (advance watermark, drop entry)
//!   receipt reverted  → escalate now
//!   no receipt, young → wait
//!   no receipt, stale → escalate
//!
//!   escalate: attempts < max → speed-up (same nonce, fees × speed-up)
//!             otherwise      → cancel (self-transfer, same nonce, fees × cancel)
//! ```
//!
//! A rejected speed-up spends an attempt too, so an entry whose replacements
//! keep failing still ends up cancelled.
//!
//! A reverted pong has already consumed its nonce, so its retry goes out on
//! a fresh nonce from the shared `NonceAllocator` and an exhausted reverted
//! entry is archived without sending a cancel.
//!
//! The ledger is only locked around individual reads and writes; chain calls
//! run unlocked so ingestion is never stalled behind a slow receipt lookup.

pub mod fees;

pub use fees::FeePolicy;

use crate::ledger::SharedLedger;
use crate::limiter::RateLimiter;
use crate::onchain::{ChainClient, FeeParams, ReceiptStatus};
use crate::reactor::{NonceAllocator, ReactorError};
use crate::store::PendingEntry;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Age after which an unmined pong is escalated.
    pub pending_timeout: Duration,
    /// Speed-ups allowed before cancelling.
    pub max_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(120),
            max_attempts: 5,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub confirmed: usize,
    pub sped_up: usize,
    pub cancelled: usize,
    pub reverted: usize,
    pub errors: usize,
    /// Entries left pending after the sweep.
    pub pending: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checked={} confirmed={} sped_up={} cancelled={} reverted={} errors={} pending={}",
            self.checked,
            self.confirmed,
            self.sped_up,
            self.cancelled,
            self.reverted,
            self.errors,
            self.pending
        )
    }
}

pub struct Reconciler {
    chain: Arc<dyn ChainClient>,
    limiter: Arc<RateLimiter>,
    nonces: Arc<NonceAllocator>,
    ledger: SharedLedger,
    fees: FeePolicy,
    config: ReconcileConfig,
    sweeping: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        limiter: Arc<RateLimiter>,
        nonces: Arc<NonceAllocator>,
        ledger: SharedLedger,
        fees: FeePolicy,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            chain,
            limiter,
            nonces,
            ledger,
            fees,
            config,
            sweeping: Mutex::new(()),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep with `now` as the reference time for timeouts.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _sweep = self.sweeping.lock().await;
        let entries: Vec<PendingEntry> = self.ledger.lock().await.pending().to_vec();

        let mut report = SweepReport::default();
        for entry in &entries {
            if entry.cancel_failures > 0 {
                error!(
                    position = %entry.position,
                    nonce = entry.nonce,
                    pong = %entry.pong_tx_hash,
                    cancel_failures = entry.cancel_failures,
                    "pong stuck: cancel keeps failing, needs operator attention"
                );
            }

            report.checked += 1;
            if let Err(e) = self.reconcile_entry(entry, now, &mut report).await {
                report.errors += 1;
                warn!(
                    position = %entry.position,
                    pong = %entry.pong_tx_hash,
                    error = %e,
                    "reconcile failed for entry, retrying next sweep"
                );
            }
        }

        report.pending = self.ledger.lock().await.pending().len();
        if report.checked > 0 {
            info!(%report, "reconcile sweep complete");
        } else {
            debug!("reconcile sweep: nothing pending");
        }
        report
    }

    async fn reconcile_entry(
        &self,
        entry: &PendingEntry,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ReactorError> {
        match self.find_receipt(entry).await? {
            Some((hash, ReceiptStatus::Success { block_number })) => {
                let advanced = self.ledger.lock().await.confirm(entry.position)?;
                report.confirmed += 1;
                info!(
                    position = %entry.position,
                    pong = %hash,
                    block = ?block_number,
                    advanced,
                    "pong confirmed"
                );
                Ok(())
            }
            Some((hash, ReceiptStatus::Reverted { block_number })) => {
                report.reverted += 1;
                warn!(
                    position = %entry.position,
                    pong = %hash,
                    block = ?block_number,
                    attempts = entry.attempts,
                    "pong reverted"
                );
                self.escalate(entry, now, true, report).await
            }
            None => {
                let age = (now - entry.submitted_at).to_std().unwrap_or_default();
                if age <= self.config.pending_timeout {
                    return Ok(());
                }
                warn!(
                    position = %entry.position,
                    pong = %entry.pong_tx_hash,
                    age_secs = age.as_secs(),
                    attempts = entry.attempts,
                    "pong still unmined past timeout"
                );
                self.escalate(entry, now, false, report).await
            }
        }
    }

    /// First receipt found among the entry's hashes, newest hash first.
    async fn find_receipt(
        &self,
        entry: &PendingEntry,
    ) -> Result<Option<(B256, ReceiptStatus)>, ReactorError> {
        for hash in entry.candidate_hashes() {
            if let Some(status) = self.limiter.schedule(self.chain.receipt(hash)).await? {
                return Ok(Some((hash, status)));
            }
        }
        Ok(None)
    }

    async fn escalate(
        &self,
        entry: &PendingEntry,
        now: DateTime<Utc>,
        reverted: bool,
        report: &mut SweepReport,
    ) -> Result<(), ReactorError> {
        let spent = entry.attempts.saturating_add(entry.speed_up_failures);
        if spent < self.config.max_attempts {
            self.speed_up(entry, now, reverted).await?;
            report.sped_up += 1;
        } else if reverted {
            self.ledger.lock().await.cancel(entry.position, None)?;
            report.cancelled += 1;
            warn!(
                position = %entry.position,
                attempts = entry.attempts,
                "giving up on reverted pong, archived"
            );
        } else {
            self.cancel(entry).await?;
            report.cancelled += 1;
        }
        Ok(())
    }

    async fn fee_estimate(&self) -> Option<FeeParams> {
        match self.limiter.schedule(self.chain.fee_estimate()).await {
            Ok(fees) => Some(fees),
            Err(e) => {
                warn!(error = %e, "fee estimate unavailable, using floor fees");
                None
            }
        }
    }

    async fn speed_up(
        &self,
        entry: &PendingEntry,
        now: DateTime<Utc>,
        reverted: bool,
    ) -> Result<(), ReactorError> {
        let fees = self.fees.speed_up(self.fee_estimate().await, entry.fees);
        let lease = if reverted {
            Some(self.nonces.reserve().await?)
        } else {
            None
        };
        let nonce = lease.as_ref().map_or(entry.nonce, |l| l.nonce());

        let sent = self
            .limiter
            .schedule(self.chain.send_reaction(entry.ping_tx_hash, nonce, fees))
            .await;
        let hash = match sent {
            Ok(hash) => hash,
            Err(e) => {
                drop(lease);
                let failures = entry.speed_up_failures + 1;
                self.ledger
                    .lock()
                    .await
                    .update_pending(entry.position, |p| p.speed_up_failures = failures)?;
                error!(
                    position = %entry.position,
                    nonce,
                    attempts = entry.attempts,
                    speed_up_failures = failures,
                    error = %e,
                    "speed-up rejected, attempt spent"
                );
                return Err(e.into());
            }
        };
        if let Some(lease) = lease {
            lease.commit();
        }

        self.ledger.lock().await.update_pending(entry.position, |e| {
            if reverted {
                // The old nonce is settled; its hashes can no longer mine.
                e.previous_tx_hashes.clear();
                e.nonce = nonce;
            } else {
                e.previous_tx_hashes.push(e.pong_tx_hash);
            }
            e.pong_tx_hash = hash;
            e.attempts += 1;
            e.speed_up_failures = 0;
            e.submitted_at = now;
            e.fees = Some(fees);
        })?;

        info!(
            position = %entry.position,
            old = %entry.pong_tx_hash,
            new = %hash,
            nonce,
            attempt = entry.attempts + 1,
            max_fee = fees.max_fee_per_gas,
            priority_fee = fees.max_priority_fee_per_gas,
            "pong sped up"
        );
        Ok(())
    }

    async fn cancel(&self, entry: &PendingEntry) -> Result<(), ReactorError> {
        let fees = self.fees.cancel(self.fee_estimate().await, entry.fees);

        match self
            .limiter
            .schedule(self.chain.send_cancel(entry.nonce, fees))
            .await
        {
            Ok(hash) => {
                self.ledger.lock().await.cancel(entry.position, Some(hash))?;
                warn!(
                    position = %entry.position,
                    ping = %entry.ping_tx_hash,
                    cancel = %hash,
                    nonce = entry.nonce,
                    max_fee = fees.max_fee_per_gas,
                    "retries exhausted, pong cancelled"
                );
                Ok(())
            }
            Err(e) => {
                let failures = entry.cancel_failures + 1;
                self.ledger
                    .lock()
                    .await
                    .update_pending(entry.position, |p| p.cancel_failures = failures)?;
                error!(
                    position = %entry.position,
                    nonce = entry.nonce,
                    cancel_failures = failures,
                    error = %e,
                    "cancel failed, entry left pending"
                );
                Err(e.into())
            }
        }
    }
}
