//! In-memory chain and push fakes shared by the unit tests.

use crate::onchain::{
    ChainClient, ChainError, FeeParams, PushChannel, PushConnector, ReceiptStatus, SourceEvent,
    SourceEventStream,
};

use alloy::primitives::{keccak256, Address, B256};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Reaction { ping_tx_hash: B256 },
    Cancel,
}

#[derive(Debug, Clone, Copy)]
pub struct SentTx {
    pub kind: SentKind,
    pub nonce: u64,
    pub fees: FeeParams,
    pub hash: B256,
}

#[derive(Default)]
struct ChainState {
    latest_block: u64,
    events: Vec<SourceEvent>,
    receipts: HashMap<B256, ReceiptStatus>,
    fee_estimate: Option<FeeParams>,
    next_nonce: u64,
    fail_sends: bool,
    fail_cancels: bool,
    fail_receipts: bool,
    fail_logs: bool,
    log_queries: Vec<(u64, u64)>,
    sent: Vec<SentTx>,
}

pub struct FakeChain {
    wallet: Address,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wallet: Address::repeat_byte(0xaa),
            state: Mutex::new(ChainState {
                fee_estimate: Some(FeeParams::from_gwei(10, 3)),
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Add a mined ping; the head follows the highest event block.
    pub fn add_event(&self, event: SourceEvent) {
        let mut s = self.state();
        s.latest_block = s.latest_block.max(event.position.block_number);
        s.events.push(event);
    }

    pub fn set_latest_block(&self, block: u64) {
        self.state().latest_block = block;
    }

    pub fn set_receipt(&self, hash: B256, status: ReceiptStatus) {
        self.state().receipts.insert(hash, status);
    }

    /// `None` makes the estimate call fail.
    pub fn set_fee_estimate(&self, fees: Option<FeeParams>) {
        self.state().fee_estimate = fees;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.state().fail_cancels = fail;
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.state().fail_receipts = fail;
    }

    pub fn fail_logs(&self, fail: bool) {
        self.state().fail_logs = fail;
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    /// Ping hashes we sent a pong for, in send order (speed-ups included).
    pub fn reactions(&self) -> Vec<B256> {
        self.state()
            .sent
            .iter()
            .filter_map(|tx| match tx.kind {
                SentKind::Reaction { ping_tx_hash } => Some(ping_tx_hash),
                SentKind::Cancel => None,
            })
            .collect()
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state().log_queries.clone()
    }

    fn record(&self, kind: SentKind, nonce: u64, fees: FeeParams) -> B256 {
        let mut s = self.state();
        let seq = s.sent.len() as u64;
        let hash = keccak256(seq.to_be_bytes());
        s.next_nonce = s.next_nonce.max(nonce + 1);
        s.sent.push(SentTx {
            kind,
            nonce,
            fees,
            hash,
        });
        hash
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn wallet_address(&self) -> Address {
        self.wallet
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.state().latest_block)
    }

    async fn source_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, ChainError> {
        let mut s = self.state();
        if s.fail_logs {
            return Err(ChainError::Transport("log query failed".into()));
        }
        s.log_queries.push((from_block, to_block));
        let mut events: Vec<SourceEvent> = s
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.position.block_number))
            .copied()
            .collect();
        events.sort_by_key(|e| e.position);
        Ok(events)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        let s = self.state();
        if s.fail_receipts {
            return Err(ChainError::Transport("receipt lookup failed".into()));
        }
        Ok(s.receipts.get(&tx_hash).copied())
    }

    async fn fee_estimate(&self) -> Result<FeeParams, ChainError> {
        self.state()
            .fee_estimate
            .ok_or_else(|| ChainError::Transport("fee history unavailable".into()))
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.state().next_nonce)
    }

    async fn send_reaction(
        &self,
        ping_tx_hash: B256,
        nonce: u64,
        fees: FeeParams,
    ) -> Result<B256, ChainError> {
        if self.state().fail_sends {
            return Err(ChainError::Rejected("replacement transaction underpriced".into()));
        }
        Ok(self.record(SentKind::Reaction { ping_tx_hash }, nonce, fees))
    }

    async fn send_cancel(&self, nonce: u64, fees: FeeParams) -> Result<B256, ChainError> {
        let s = self.state();
        if s.fail_sends || s.fail_cancels {
            return Err(ChainError::Rejected("nonce too low".into()));
        }
        drop(s);
        Ok(self.record(SentKind::Cancel, nonce, fees))
    }

    async fn pinger(&self) -> Result<Address, ChainError> {
        Ok(Address::repeat_byte(0xbb))
    }
}

// ─── Push ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PushState {
    fail_connect: bool,
    fail_probe: bool,
    hang_probe: bool,
    connects: usize,
    subscriptions: usize,
    sender: Option<mpsc::UnboundedSender<SourceEvent>>,
}

/// Push connector whose channels are driven from the test. Each successful
/// `subscribe` replaces the current sender; `close()` ends the stream.
#[derive(Default)]
pub struct FakePush {
    state: Arc<Mutex<PushState>>,
}

impl FakePush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PushState> {
        self.state.lock().unwrap()
    }

    /// Deliver an event on the live subscription. Returns `false` if there
    /// is none.
    pub fn emit(&self, event: SourceEvent) -> bool {
        match &self.state().sender {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    /// Close the live subscription, as a dropped socket would.
    pub fn close(&self) {
        self.state().sender = None;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.state().fail_probe = fail;
    }

    /// Make probes never complete.
    pub fn set_hang_probe(&self, hang: bool) {
        self.state().hang_probe = hang;
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }
}

#[async_trait]
impl PushConnector for FakePush {
    async fn connect(&self) -> Result<Arc<dyn PushChannel>, ChainError> {
        let mut s = self.state();
        s.connects += 1;
        if s.fail_connect {
            return Err(ChainError::Transport("connection refused".into()));
        }
        Ok(Arc::new(FakeChannel {
            state: self.state.clone(),
        }))
    }
}

struct FakeChannel {
    state: Arc<Mutex<PushState>>,
}

#[async_trait]
impl PushChannel for FakeChannel {
    async fn probe(&self) -> Result<u64, ChainError> {
        let (fail, hang) = {
            let s = self.state.lock().unwrap();
            (s.fail_probe, s.hang_probe)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if fail {
            return Err(ChainError::Transport("probe failed".into()));
        }
        Ok(1)
    }

    async fn subscribe(&self) -> Result<SourceEventStream, ChainError> {
        let (tx, rx) = mpsc::unbounded();
        let mut s = self.state.lock().unwrap();
        s.subscriptions += 1;
        s.sender = Some(tx);
        Ok(rx.boxed())
    }
}

pub fn event(block: u64, index: u64) -> SourceEvent {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&block.to_be_bytes());
    seed[8..].copy_from_slice(&index.to_be_bytes());
    SourceEvent::new(
        keccak256(seed),
        crate::onchain::Position::new(block, index),
    )
}
