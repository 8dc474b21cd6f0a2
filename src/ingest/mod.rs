//! Event ingestion: the single admission gate both delivery paths feed, and
//! the poll-and-diff scanner.
//!
//! Push and poll deliver the same logical stream of pings. Every event goes
//! through `admit`, which compares its position against the ledger cutoff
//! and, only if it is newer, hands it to the submitter. Admission is
//! serialized, so a ping seen on both channels at the same moment is still
//! reacted to once.
//!
//! Push batches are gap-checked first: the blocks between the cutoff and the
//! batch are scanned over HTTP, so a ping the subscription never delivered
//! is admitted before a later one can raise the cutoff past it.

use crate::ledger::SharedLedger;
use crate::limiter::RateLimiter;
use crate::onchain::{ChainClient, ChainError, SourceEvent};
use crate::reactor::Submitter;

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// At or below the cutoff; already handled.
    Discarded,
    Submitted,
    /// Submission failed. The event stays above the cutoff unless a later
    /// event is submitted.
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    pub discarded: usize,
    /// A submission failed and the rest of the batch was skipped.
    pub halted: bool,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.submitted += other.submitted;
        self.discarded += other.discarded;
        self.halted |= other.halted;
    }
}

pub struct Ingestor {
    chain: Arc<dyn ChainClient>,
    limiter: Arc<RateLimiter>,
    ledger: SharedLedger,
    submitter: Submitter,
    admission: Mutex<()>,
    max_block_range: u64,
}

impl Ingestor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        limiter: Arc<RateLimiter>,
        ledger: SharedLedger,
        submitter: Submitter,
        max_block_range: u64,
    ) -> Self {
        Self {
            chain,
            limiter,
            ledger,
            submitter,
            admission: Mutex::new(()),
            max_block_range: max_block_range.max(1),
        }
    }

    /// Admit one event. `source` only labels the logs.
    pub async fn admit(&self, event: SourceEvent, source: &'static str) -> Admission {
        let _gate = self.admission.lock().await;

        if let Some(cutoff) = self.ledger.lock().await.cutoff() {
            if event.position <= cutoff {
                debug!(source, event = %event, cutoff = %cutoff, "already handled, discarding");
                return Admission::Discarded;
            }
        }

        info!(source, event = %event, "new ping");
        match self.submitter.submit(&event).await {
            Ok(_) => Admission::Submitted,
            Err(e) => {
                warn!(source, event = %event, error = %e, "pong submission failed, leaving for re-discovery");
                Admission::Failed
            }
        }
    }

    /// Admit a batch in ascending position order. Stops at the first failed
    /// submission so nothing after it raises the cutoff past the failed
    /// event.
    pub async fn admit_batch(
        &self,
        mut events: Vec<SourceEvent>,
        source: &'static str,
    ) -> BatchReport {
        events.sort_by_key(|e| e.position);
        events.dedup_by_key(|e| e.position);

        let mut report = BatchReport::default();
        for event in events {
            match self.admit(event, source).await {
                Admission::Discarded => report.discarded += 1,
                Admission::Submitted => report.submitted += 1,
                Admission::Failed => {
                    report.halted = true;
                    break;
                }
            }
        }
        report
    }

    /// Admit a batch delivered by the push subscription, after scanning the
    /// blocks between the cutoff and the batch for pings it skipped. If the
    /// scan fails nothing is admitted; the batch stays above the cutoff for
    /// the next poll.
    pub async fn admit_push(&self, events: Vec<SourceEvent>) -> BatchReport {
        let Some(lowest) = events.iter().map(|e| e.position.block_number).min() else {
            return BatchReport::default();
        };
        let from = self.scan_start().await;

        let mut batch = events;
        if lowest > from {
            match self.fetch_range(from, lowest - 1).await {
                Ok(missed) => {
                    if let Some(first) = missed.iter().map(|e| e.position).min() {
                        warn!(
                            missed = missed.len(),
                            first = %first,
                            "push skipped pings, admitting them first"
                        );
                    }
                    batch.extend(missed);
                }
                Err(e) => {
                    warn!(error = %e, from, to = lowest - 1, "gap check failed, deferring push batch");
                    return BatchReport {
                        halted: true,
                        ..Default::default()
                    };
                }
            }
        }
        self.admit_batch(batch, "push").await
    }

    /// First block that may hold an unhandled ping. The cutoff's own block
    /// counts since later logs in it may still be new; `admit` filters them.
    async fn scan_start(&self) -> u64 {
        self.ledger
            .lock()
            .await
            .cutoff()
            .map_or(0, |c| c.block_number)
    }

    /// Pings in `[from, to]`, queried in chunks of at most `max_block_range`.
    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<SourceEvent>, ChainError> {
        let mut events = Vec::new();
        let mut start = from;
        while start <= to {
            let end = to.min(start.saturating_add(self.max_block_range - 1));
            events.extend(
                self.limiter
                    .schedule(self.chain.source_events(start, end))
                    .await?,
            );
            start = end + 1;
        }
        Ok(events)
    }

    /// Scan `(cutoff, latest]` for pings and admit them, chunk by chunk.
    pub async fn poll_once(&self) -> Result<BatchReport, ChainError> {
        let latest = self.limiter.schedule(self.chain.latest_block()).await?;
        let mut from = self.scan_start().await;

        let mut report = BatchReport::default();
        if from > latest {
            debug!(from, latest, "cutoff ahead of head, nothing to poll");
            return Ok(report);
        }

        while from <= latest {
            let to = latest.min(from.saturating_add(self.max_block_range - 1));
            let events = self
                .limiter
                .schedule(self.chain.source_events(from, to))
                .await?;
            if !events.is_empty() {
                debug!(from, to, found = events.len(), "poll chunk");
            }
            report.merge(self.admit_batch(events, "poll").await);
            if report.halted {
                break;
            }
            from = to + 1;
        }

        if report.submitted > 0 || report.halted {
            info!(
                latest,
                submitted = report.submitted,
                discarded = report.discarded,
                halted = report.halted,
                "poll complete"
            );
        }
        Ok(report)
    }

    /// Poll once, logging instead of returning the error. Used by the
    /// periodic poll task.
    pub async fn poll_tick(&self) {
        if let Err(e) = self.poll_once().await {
            warn!(error = %e, "poll failed, retrying next tick");
        }
    }
}
