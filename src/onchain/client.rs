//! Chain client seams and their alloy-backed implementations.
//!
//! Two halves, split the same way the transports are:
//! - `ChainClient`: HTTP request/response calls.
//! - `PushConnector` → `PushChannel`: a WebSocket connection that can be
//!   probed for liveness and subscribed to for new `Ping()` logs. The health
//!   monitor owns the channel and rebuilds it after failures.

use crate::onchain::abi;
use crate::onchain::types::{FeeParams, ReceiptStatus, SourceEvent};

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Decoded `Ping()` events delivered by a push subscription, in arrival
/// order. The stream ends when the underlying connection closes.
pub type SourceEventStream = BoxStream<'static, SourceEvent>;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<TransportError> for ChainError {
    fn from(e: TransportError) -> Self {
        ChainError::Transport(e.to_string())
    }
}

/// Node-side rejections (nonce too low, underpriced replacement, reverts at
/// estimation) come back as JSON-RPC error responses; anything else is a
/// transport problem.
fn classify_send_error(e: TransportError) -> ChainError {
    match e {
        RpcError::ErrorResp(resp) => ChainError::Rejected(resp.to_string()),
        other => ChainError::Transport(other.to_string()),
    }
}

/// Request/response access to the chain, scoped to one contract and one
/// wallet.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address of the signing wallet. Cancels are self-transfers to it.
    fn wallet_address(&self) -> Address;

    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// All `Ping()` events in the inclusive block range, ascending.
    async fn source_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, ChainError>;

    /// `None` while the transaction is still unmined (or unknown).
    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError>;

    async fn fee_estimate(&self) -> Result<FeeParams, ChainError>;

    /// Next nonce for the wallet, counting transactions still in the pool.
    async fn pending_nonce(&self) -> Result<u64, ChainError>;

    /// Send `pong(ping_tx_hash)` with explicit nonce and fees.
    async fn send_reaction(
        &self,
        ping_tx_hash: B256,
        nonce: u64,
        fees: FeeParams,
    ) -> Result<B256, ChainError>;

    /// Send a zero-value self-transfer at `nonce` to displace whatever is
    /// queued there.
    async fn send_cancel(&self, nonce: u64, fees: FeeParams) -> Result<B256, ChainError>;

    /// Read the contract's `pinger()` view. Used as a startup connectivity
    /// check.
    async fn pinger(&self) -> Result<Address, ChainError>;
}

/// Factory for push channels.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PushChannel>, ChainError>;
}

/// A live push connection.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Cheap round-trip over the push transport. Returns the head block.
    async fn probe(&self) -> Result<u64, ChainError>;

    async fn subscribe(&self) -> Result<SourceEventStream, ChainError>;
}

fn ping_filter(contract: Address) -> Filter {
    Filter::new()
        .address(contract)
        .event_signature(abi::PING_TOPIC)
}

// ─── HTTP client ─────────────────────────────────────────────────────────────

pub struct AlloyChainClient {
    provider: DynProvider,
    wallet_address: Address,
    contract: Address,
}

impl AlloyChainClient {
    /// Build a signing HTTP provider for `url`.
    pub async fn connect(
        url: &str,
        signer: PrivateKeySigner,
        contract: Address,
    ) -> Result<Self, ChainError> {
        let wallet_address = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect(url)
            .await?
            .erased();

        info!(wallet = %wallet_address, contract = %contract, "HTTP chain client ready");
        Ok(Self {
            provider,
            wallet_address,
            contract,
        })
    }

    fn base_request(&self, nonce: u64, fees: FeeParams) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.wallet_address)
            .with_nonce(nonce)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn source_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<SourceEvent>, ChainError> {
        let filter = ping_filter(self.contract)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.provider.get_logs(&filter).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match SourceEvent::from_log(log) {
                Ok(event) => events.push(event),
                Err(e) => debug!(error = %e, "skipping undecodable log"),
            }
        }
        events.sort_by_key(|e| e.position);
        Ok(events)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        Ok(receipt.map(|r| {
            if r.status() {
                ReceiptStatus::Success {
                    block_number: r.block_number,
                }
            } else {
                ReceiptStatus::Reverted {
                    block_number: r.block_number,
                }
            }
        }))
    }

    async fn fee_estimate(&self) -> Result<FeeParams, ChainError> {
        let est = self.provider.estimate_eip1559_fees().await?;
        Ok(FeeParams::new(
            est.max_fee_per_gas,
            est.max_priority_fee_per_gas,
        ))
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(self
            .provider
            .get_transaction_count(self.wallet_address)
            .pending()
            .await?)
    }

    async fn send_reaction(
        &self,
        ping_tx_hash: B256,
        nonce: u64,
        fees: FeeParams,
    ) -> Result<B256, ChainError> {
        let tx = self
            .base_request(nonce, fees)
            .with_to(self.contract)
            .with_input(abi::encode_pong(ping_tx_hash));
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(classify_send_error)?;
        Ok(*pending.tx_hash())
    }

    async fn send_cancel(&self, nonce: u64, fees: FeeParams) -> Result<B256, ChainError> {
        let tx = self
            .base_request(nonce, fees)
            .with_to(self.wallet_address)
            .with_value(U256::ZERO);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(classify_send_error)?;
        Ok(*pending.tx_hash())
    }

    async fn pinger(&self) -> Result<Address, ChainError> {
        let call = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(abi::encode_pinger());
        let out = self.provider.call(call).await?;
        if out.len() < 32 {
            return Err(ChainError::Decode(format!(
                "pinger() returned {} bytes",
                out.len()
            )));
        }
        Ok(Address::from_slice(&out[12..32]))
    }
}

// ─── WebSocket push ──────────────────────────────────────────────────────────

pub struct AlloyPushConnector {
    ws_url: String,
    contract: Address,
}

impl AlloyPushConnector {
    pub fn new(ws_url: String, contract: Address) -> Self {
        Self { ws_url, contract }
    }
}

#[async_trait]
impl PushConnector for AlloyPushConnector {
    async fn connect(&self) -> Result<Arc<dyn PushChannel>, ChainError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.ws_url.as_str()).with_max_retries(0))
            .await?
            .erased();
        debug!(url = %self.ws_url, "WebSocket provider created");
        Ok(Arc::new(AlloyPushChannel {
            provider,
            contract: self.contract,
        }))
    }
}

struct AlloyPushChannel {
    provider: DynProvider,
    contract: Address,
}

#[async_trait]
impl PushChannel for AlloyPushChannel {
    async fn probe(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn subscribe(&self) -> Result<SourceEventStream, ChainError> {
        let sub = self
            .provider
            .subscribe_logs(&ping_filter(self.contract))
            .await?;

        let stream = sub.into_stream().filter_map(|log| async move {
            match SourceEvent::from_log(&log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable push log");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
