//! JSON document store for the bot's durable state.
//!
//! Data model (one file per document, all under the configured data dir):
//!   state.json       → ConfirmedState           (overwritten on advance)
//!   pending.json     → [PendingEntry]           (overwritten on every mutation)
//!   cancelled.json   → [PendingEntry]           (archive, one per position)
//!
//! Every write goes to a sibling `.tmp` file first and is renamed into
//! place, so a crash leaves either the old or the new document, never a
//! torn one.

use crate::onchain::{FeeParams, Position, SourceEvent};

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const CONFIRMED_FILE: &str = "state.json";
const PENDING_FILE: &str = "pending.json";
const CANCELLED_FILE: &str = "cancelled.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Highest source event whose pong has been mined successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

impl ConfirmedState {
    pub fn new(position: Position) -> Self {
        Self {
            position,
            updated_at: Utc::now(),
        }
    }
}

/// One in-flight pong transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Where the triggering ping sits on chain. Unique across entries.
    pub position: Position,
    pub ping_tx_hash: B256,
    /// Hash of the most recent pong (or replacement) we broadcast.
    pub pong_tx_hash: B256,
    /// Hashes superseded by speed-ups, oldest first. Any of them may still be
    /// the one that gets mined.
    #[serde(default)]
    pub previous_tx_hashes: Vec<B256>,
    pub submitted_at: DateTime<Utc>,
    pub attempts: u32,
    pub nonce: u64,
    /// Fees the current hash was sent with.
    #[serde(default)]
    pub fees: Option<FeeParams>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cancel_tx_hash: Option<B256>,
    /// Consecutive failed cancel attempts. Non-zero means the entry needs an
    /// operator.
    #[serde(default)]
    pub cancel_failures: u32,
    /// Consecutive rejected speed-ups. Each one spends an attempt.
    #[serde(default)]
    pub speed_up_failures: u32,
}

impl PendingEntry {
    pub fn new(
        event: &SourceEvent,
        pong_tx_hash: B256,
        nonce: u64,
        fees: FeeParams,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            position: event.position,
            ping_tx_hash: event.tx_hash,
            pong_tx_hash,
            previous_tx_hashes: Vec::new(),
            submitted_at,
            attempts: 0,
            nonce,
            fees: Some(fees),
            canceled: false,
            cancel_tx_hash: None,
            cancel_failures: 0,
            speed_up_failures: 0,
        }
    }

    /// Current hash first, then superseded ones newest to oldest.
    pub fn candidate_hashes(&self) -> impl Iterator<Item = B256> + '_ {
        std::iter::once(self.pong_tx_hash).chain(self.previous_tx_hashes.iter().rev().copied())
    }
}

/// File-backed store. Cheap to clone; holds only the directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "state store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    // --- Confirmed ---

    pub fn load_confirmed(&self) -> Result<Option<ConfirmedState>, StoreError> {
        read_json(&self.path(CONFIRMED_FILE))
    }

    pub fn save_confirmed(&self, state: &ConfirmedState) -> Result<(), StoreError> {
        write_json_atomic(&self.path(CONFIRMED_FILE), state)?;
        debug!(position = %state.position, "confirmed state saved");
        Ok(())
    }

    // --- Pending ---

    pub fn load_pending(&self) -> Result<Vec<PendingEntry>, StoreError> {
        Ok(read_json(&self.path(PENDING_FILE))?.unwrap_or_default())
    }

    pub fn save_pending(&self, entries: &[PendingEntry]) -> Result<(), StoreError> {
        write_json_atomic(&self.path(PENDING_FILE), &entries)?;
        debug!(count = entries.len(), "pending entries saved");
        Ok(())
    }

    // --- Cancelled archive ---

    pub fn load_cancelled(&self) -> Result<Vec<PendingEntry>, StoreError> {
        Ok(read_json(&self.path(CANCELLED_FILE))?.unwrap_or_default())
    }

    /// Add `entry` to the cancelled archive, replacing any earlier record
    /// for the same position.
    pub fn archive_cancelled(&self, entry: &PendingEntry) -> Result<(), StoreError> {
        let mut archived = self.load_cancelled()?;
        match archived.iter_mut().find(|e| e.position == entry.position) {
            Some(existing) => *existing = entry.clone(),
            None => archived.push(entry.clone()),
        }
        write_json_atomic(&self.path(CANCELLED_FILE), &archived)?;
        info!(
            nonce = entry.nonce,
            position = %entry.position,
            archived = archived.len(),
            "entry archived as cancelled"
        );
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block: u64, index: u64) -> PendingEntry {
        let event = SourceEvent::new(B256::repeat_byte(1), Position::new(block, index));
        PendingEntry::new(
            &event,
            B256::repeat_byte(2),
            9,
            FeeParams::from_gwei(5, 2),
            Utc::now(),
        )
    }

    #[test]
    fn test_missing_documents_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load_confirmed().unwrap().is_none());
        assert!(store.load_pending().unwrap().is_empty());
        assert!(store.load_cancelled().unwrap().is_empty());
    }

    #[test]
    fn test_pending_and_confirmed_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.save_pending(&[entry(10, 0), entry(11, 4)]).unwrap();
            store
                .save_confirmed(&ConfirmedState::new(Position::new(9, 1)))
                .unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        let pending = store.load_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].position, Position::new(11, 4));
        assert_eq!(
            store.load_confirmed().unwrap().unwrap().position,
            Position::new(9, 1)
        );
        assert!(!dir.path().join("pending.json.tmp").exists());
    }

    #[test]
    fn test_cancelled_archive_keeps_one_record_per_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.archive_cancelled(&entry(1, 0)).unwrap();
        store.archive_cancelled(&entry(2, 0)).unwrap();

        let mut again = entry(1, 0);
        again.cancel_tx_hash = Some(B256::repeat_byte(0xcc));
        store.archive_cancelled(&again).unwrap();

        let archived = store.load_cancelled().unwrap();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].position, Position::new(1, 0));
        assert_eq!(archived[0].cancel_tx_hash, Some(B256::repeat_byte(0xcc)));
    }

    #[test]
    fn test_corrupt_pending_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pending.json"), "{not json").unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(matches!(store.load_pending(), Err(StoreError::Json(_))));
    }

    #[test]
    fn test_candidate_hashes_current_first() {
        let mut e = entry(1, 0);
        e.previous_tx_hashes = vec![B256::repeat_byte(0xa), B256::repeat_byte(0xb)];
        let hashes: Vec<B256> = e.candidate_hashes().collect();
        assert_eq!(
            hashes,
            vec![
                B256::repeat_byte(2),
                B256::repeat_byte(0xb),
                B256::repeat_byte(0xa)
            ]
        );
    }
}
