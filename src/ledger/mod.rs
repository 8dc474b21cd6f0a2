//! In-memory view of the bot's progress, backed by the `StateStore`.
//!
//! The ledger owns three watermarks, each absent until something sets it:
//! - confirmed: highest ping whose pong was mined successfully (durable)
//! - pending:   highest ping with a pong still in flight (derived from entries)
//! - cancelled: highest ping whose pong we gave up on (derived from archive)
//!
//! Their maximum is the ingestion cutoff. Any ping at or below it has been
//! handled and must not trigger another pong. With no watermark at all,
//! every ping is new, including one at block 0.
//!
//! All mutations go through a handful of methods that build the new state,
//! write it to disk, and only then swap it in. A failed write leaves the
//! in-memory state untouched.

use crate::onchain::Position;
use crate::store::{ConfirmedState, PendingEntry, StateStore, StoreError};

use alloy::primitives::B256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The single exclusive section guarding ledger mutation.
pub type SharedLedger = Arc<Mutex<Ledger>>;

pub struct Ledger {
    store: StateStore,
    confirmed: Option<ConfirmedState>,
    /// Sorted ascending by position, positions unique.
    pending: Vec<PendingEntry>,
    cancelled_high: Option<Position>,
}

impl Ledger {
    /// Load from disk. With no confirmed record yet, seed one from
    /// `starting_block` and persist it. Without a starting block (or with
    /// block 0) nothing is seeded.
    pub fn load(store: StateStore, starting_block: Option<u64>) -> Result<Self, StoreError> {
        let confirmed = match store.load_confirmed()? {
            Some(state) => {
                info!(position = %state.position, "loaded confirmed state");
                Some(state)
            }
            None => match starting_block.and_then(Position::before_block) {
                Some(seed) => {
                    let state = ConfirmedState::new(seed);
                    store.save_confirmed(&state)?;
                    info!(
                        starting_block = ?starting_block,
                        position = %seed,
                        "no confirmed state found, seeded"
                    );
                    Some(state)
                }
                None => {
                    info!("no confirmed state found, scanning from genesis");
                    None
                }
            },
        };

        let mut pending = store.load_pending()?;
        pending.sort_by_key(|e| e.position);
        let before = pending.len();
        pending.dedup_by_key(|e| e.position);
        if pending.len() != before {
            warn!(
                dropped = before - pending.len(),
                "duplicate pending positions on disk, keeping first of each"
            );
        }

        let cancelled_high = store.load_cancelled()?.iter().map(|e| e.position).max();

        info!(
            pending = pending.len(),
            confirmed = ?confirmed.map(|c| c.position.to_string()),
            cancelled_high = ?cancelled_high.map(|p| p.to_string()),
            "ledger loaded"
        );

        Ok(Self {
            store,
            confirmed,
            pending,
            cancelled_high,
        })
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    // --- Watermarks ---

    pub fn confirmed(&self) -> Option<Position> {
        self.confirmed.map(|c| c.position)
    }

    pub fn pending_watermark(&self) -> Option<Position> {
        self.pending.last().map(|e| e.position)
    }

    pub fn cancelled_watermark(&self) -> Option<Position> {
        self.cancelled_high
    }

    /// `max(confirmed, pending, cancelled)`, `None` while all three are
    /// unset.
    pub fn cutoff(&self) -> Option<Position> {
        [self.confirmed(), self.pending_watermark(), self.cancelled_high]
            .into_iter()
            .flatten()
            .max()
    }

    /// True when a ping at `position` has already been reacted to or is
    /// being reacted to.
    pub fn is_handled(&self, position: Position) -> bool {
        self.cutoff().is_some_and(|cutoff| position <= cutoff)
    }

    // --- Pending entries ---

    pub fn pending(&self) -> &[PendingEntry] {
        &self.pending
    }

    pub fn get(&self, position: Position) -> Option<&PendingEntry> {
        self.index_of(position).map(|i| &self.pending[i])
    }

    fn index_of(&self, position: Position) -> Option<usize> {
        self.pending
            .binary_search_by_key(&position, |e| e.position)
            .ok()
    }

    fn commit_pending(&mut self, next: Vec<PendingEntry>) -> Result<(), StoreError> {
        self.store.save_pending(&next)?;
        self.pending = next;
        Ok(())
    }

    /// Record a freshly submitted pong. Returns `false` if an entry for the
    /// same position already exists.
    pub fn add_pending(&mut self, entry: PendingEntry) -> Result<bool, StoreError> {
        let slot = match self
            .pending
            .binary_search_by_key(&entry.position, |e| e.position)
        {
            Ok(_) => return Ok(false),
            Err(slot) => slot,
        };
        let mut next = self.pending.clone();
        next.insert(slot, entry);
        self.commit_pending(next)?;
        Ok(true)
    }

    /// Apply `update` to the entry at `position`. Returns `false` if there is
    /// no such entry.
    pub fn update_pending<F>(&mut self, position: Position, update: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut PendingEntry),
    {
        let Some(i) = self.index_of(position) else {
            return Ok(false);
        };
        let mut next = self.pending.clone();
        update(&mut next[i]);
        // The key must not change under us.
        next[i].position = position;
        self.commit_pending(next)?;
        Ok(true)
    }

    pub fn remove_pending(
        &mut self,
        position: Position,
    ) -> Result<Option<PendingEntry>, StoreError> {
        let Some(i) = self.index_of(position) else {
            return Ok(None);
        };
        let mut next = self.pending.clone();
        let removed = next.remove(i);
        self.commit_pending(next)?;
        Ok(Some(removed))
    }

    // --- Terminal transitions ---

    /// A pong for `position` was mined successfully: advance the confirmed
    /// watermark if this is newer, then drop the entry. Returns whether the
    /// watermark moved.
    pub fn confirm(&mut self, position: Position) -> Result<bool, StoreError> {
        let advanced = if self.confirmed().map_or(true, |c| position > c) {
            let state = ConfirmedState::new(position);
            self.store.save_confirmed(&state)?;
            self.confirmed = Some(state);
            true
        } else {
            false
        };
        self.remove_pending(position)?;
        Ok(advanced)
    }

    /// Give up on the entry at `position`: archive it (marked canceled,
    /// carrying the cancel hash if one was sent) and drop it from the pending
    /// set. The archive holds one record per position, so retrying after a
    /// failed pending write replaces the record instead of adding another.
    pub fn cancel(
        &mut self,
        position: Position,
        cancel_tx_hash: Option<B256>,
    ) -> Result<Option<PendingEntry>, StoreError> {
        let Some(entry) = self.get(position) else {
            return Ok(None);
        };
        let mut archived = entry.clone();
        archived.canceled = true;
        archived.cancel_tx_hash = cancel_tx_hash;

        self.store.archive_cancelled(&archived)?;
        self.cancelled_high = self.cancelled_high.max(Some(position));
        self.remove_pending(position)?;
        Ok(Some(archived))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::{FeeParams, SourceEvent};
    use chrono::Utc;

    fn entry(block: u64, index: u64) -> PendingEntry {
        let event = SourceEvent::new(B256::repeat_byte(1), Position::new(block, index));
        PendingEntry::new(
            &event,
            B256::repeat_byte(2),
            block,
            FeeParams::from_gwei(5, 2),
            Utc::now(),
        )
    }

    fn open(dir: &std::path::Path, starting_block: Option<u64>) -> Ledger {
        Ledger::load(StateStore::open(dir).unwrap(), starting_block).unwrap()
    }

    #[test]
    fn test_seeds_confirmed_from_starting_block() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path(), Some(1_000));
        assert!(ledger.is_handled(Position::new(999, 50)));
        assert!(!ledger.is_handled(Position::new(1_000, 0)));

        // Seed is persisted, a later starting block does not override it.
        let reopened = open(dir.path(), Some(5_000));
        assert_eq!(reopened.confirmed(), Position::before_block(1_000));
    }

    #[test]
    fn test_unseeded_ledger_admits_genesis_ping() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        assert_eq!(ledger.cutoff(), None);
        assert!(!ledger.is_handled(Position::new(0, 0)));
        assert!(StateStore::open(dir.path()).unwrap().load_confirmed().unwrap().is_none());

        ledger.add_pending(entry(0, 0)).unwrap();
        assert!(ledger.is_handled(Position::new(0, 0)));
        assert!(!ledger.is_handled(Position::new(0, 1)));

        let reopened = open(dir.path(), Some(0));
        assert_eq!(reopened.confirmed(), None);
        assert_eq!(reopened.cutoff(), Some(Position::new(0, 0)));
    }

    #[test]
    fn test_cutoff_combines_confirmed_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        ledger.confirm(Position::new(100, 2)).unwrap();
        ledger.add_pending(entry(105, 0)).unwrap();

        assert!(ledger.is_handled(Position::new(103, 1)));
        assert!(ledger.is_handled(Position::new(105, 0)));
        assert!(!ledger.is_handled(Position::new(106, 0)));
    }

    #[test]
    fn test_add_pending_keeps_order_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        assert!(ledger.add_pending(entry(20, 0)).unwrap());
        assert!(ledger.add_pending(entry(10, 5)).unwrap());
        assert!(!ledger.add_pending(entry(20, 0)).unwrap());

        let positions: Vec<Position> = ledger.pending().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![Position::new(10, 5), Position::new(20, 0)]);
        assert_eq!(ledger.pending_watermark(), Some(Position::new(20, 0)));
    }

    #[test]
    fn test_mutations_are_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = open(dir.path(), None);
            ledger.add_pending(entry(10, 0)).unwrap();
            ledger.add_pending(entry(11, 0)).unwrap();
            ledger
                .update_pending(Position::new(10, 0), |e| e.attempts = 3)
                .unwrap();
            ledger.remove_pending(Position::new(11, 0)).unwrap();
        }

        let ledger = open(dir.path(), None);
        assert_eq!(ledger.pending().len(), 1);
        assert_eq!(ledger.get(Position::new(10, 0)).unwrap().attempts, 3);
    }

    #[test]
    fn test_confirm_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        ledger.confirm(Position::new(50, 1)).unwrap();
        ledger.add_pending(entry(50, 3)).unwrap();
        ledger.add_pending(entry(40, 0)).unwrap();

        assert!(ledger.confirm(Position::new(50, 3)).unwrap());
        assert_eq!(ledger.confirmed(), Some(Position::new(50, 3)));

        assert!(!ledger.confirm(Position::new(40, 0)).unwrap());
        assert_eq!(ledger.confirmed(), Some(Position::new(50, 3)));
        assert!(ledger.pending().is_empty());

        let reopened = open(dir.path(), None);
        assert_eq!(reopened.confirmed(), Some(Position::new(50, 3)));
    }

    #[test]
    fn test_cancel_archives_and_keeps_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        ledger.add_pending(entry(70, 1)).unwrap();

        let archived = ledger
            .cancel(Position::new(70, 1), Some(B256::repeat_byte(0xcc)))
            .unwrap()
            .unwrap();
        assert!(archived.canceled);
        assert_eq!(archived.cancel_tx_hash, Some(B256::repeat_byte(0xcc)));
        assert!(ledger.pending().is_empty());

        // The cancelled ping stays handled, also across restarts.
        assert!(ledger.is_handled(Position::new(70, 1)));
        let reopened = open(dir.path(), None);
        assert!(reopened.is_handled(Position::new(70, 1)));
        assert!(!reopened.is_handled(Position::new(70, 2)));
    }

    #[test]
    fn test_cancel_retry_after_failed_pending_write_archives_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(dir.path(), None);
        ledger.add_pending(entry(70, 1)).unwrap();

        // A directory in the way of the temp file makes the pending write fail.
        let blocker = dir.path().join("pending.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(ledger.cancel(Position::new(70, 1), Some(B256::repeat_byte(0xc1))).is_err());
        assert!(ledger.get(Position::new(70, 1)).is_some());

        std::fs::remove_dir(&blocker).unwrap();
        ledger
            .cancel(Position::new(70, 1), Some(B256::repeat_byte(0xc2)))
            .unwrap()
            .unwrap();
        assert!(ledger.pending().is_empty());

        let archived = StateStore::open(dir.path()).unwrap().load_cancelled().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].cancel_tx_hash, Some(B256::repeat_byte(0xc2)));
    }
}
