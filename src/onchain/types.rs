//! Typed values that cross the chain boundary.

use crate::onchain::abi;
use crate::onchain::client::ChainError;

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use serde::{Deserialize, Serialize};

/// Location of a source event on chain: block height first, then the log's
/// index inside that block. Field order matters, the derived `Ord` compares
/// `block_number` before `log_index`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub block_number: u64,
    pub log_index: u64,
}

impl Position {
    pub const fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }

    /// A position that sorts after every log of `block - 1` and before any
    /// log of `block`. Used to seed the confirmed watermark from a starting
    /// height. Block 0 has nothing before it.
    pub fn before_block(block: u64) -> Option<Self> {
        block
            .checked_sub(1)
            .map(|prev| Self::new(prev, u64::MAX))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// A decoded `Ping()` emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEvent {
    /// Hash of the transaction that emitted the ping. This is the argument
    /// passed back to `pong(bytes32)`.
    pub tx_hash: B256,
    pub position: Position,
}

impl SourceEvent {
    pub fn new(tx_hash: B256, position: Position) -> Self {
        Self { tx_hash, position }
    }

    /// Decode a raw RPC log. Rejects logs of other events, logs retracted by
    /// a reorg, and logs without a mined location (pending logs carry no
    /// block number or index).
    pub fn from_log(log: &Log) -> Result<Self, ChainError> {
        let topic0 = log
            .topic0()
            .ok_or_else(|| ChainError::Decode("log has no topic0".into()))?;
        if *topic0 != abi::PING_TOPIC {
            return Err(ChainError::Decode(format!("unexpected topic {topic0}")));
        }
        if log.removed {
            return Err(ChainError::Decode("log was removed by a reorg".into()));
        }

        let block_number = log
            .block_number
            .ok_or_else(|| ChainError::Decode("log has no block number".into()))?;
        let log_index = log
            .log_index
            .ok_or_else(|| ChainError::Decode("log has no log index".into()))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| ChainError::Decode("log has no transaction hash".into()))?;

        Ok(Self::new(tx_hash, Position::new(block_number, log_index)))
    }
}

impl std::fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ping(tx={}, at={})", &format!("{}", self.tx_hash)[..14], self.position)
    }
}

/// EIP-1559 fee pair, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl FeeParams {
    pub const fn new(max_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }

    pub fn from_gwei(max_fee_gwei: u64, priority_fee_gwei: u64) -> Self {
        const GWEI: u128 = 1_000_000_000;
        Self::new(max_fee_gwei as u128 * GWEI, priority_fee_gwei as u128 * GWEI)
    }

    /// Component-wise maximum.
    pub fn max(self, other: FeeParams) -> FeeParams {
        FeeParams::new(
            self.max_fee_per_gas.max(other.max_fee_per_gas),
            self.max_priority_fee_per_gas
                .max(other.max_priority_fee_per_gas),
        )
    }
}

/// Mined outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success { block_number: Option<u64> },
    Reverted { block_number: Option<u64> },
}

impl ReceiptStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ReceiptStatus::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, LogData};

    fn ping_log(block: Option<u64>, index: Option<u64>, topic: B256) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(vec![topic], Default::default()),
            },
            block_number: block,
            log_index: index,
            transaction_hash: Some(B256::repeat_byte(7)),
            ..Default::default()
        }
    }

    #[test]
    fn test_position_orders_by_block_then_index() {
        assert!(Position::new(100, 2) < Position::new(101, 0));
        assert!(Position::new(100, 2) < Position::new(100, 3));
        assert!(Position::new(105, 0) > Position::new(103, 1));
        assert_eq!(Position::new(7, 7), Position::new(7, 7));
    }

    #[test]
    fn test_before_block_sorts_between_blocks() {
        let seed = Position::before_block(500).unwrap();
        assert!(seed > Position::new(499, 10_000));
        assert!(seed < Position::new(500, 0));
        assert_eq!(Position::before_block(0), None);
    }

    #[test]
    fn test_from_log_decodes_ping() {
        let log = ping_log(Some(42), Some(3), abi::PING_TOPIC);
        let event = SourceEvent::from_log(&log).unwrap();
        assert_eq!(event.position, Position::new(42, 3));
        assert_eq!(event.tx_hash, B256::repeat_byte(7));
    }

    #[test]
    fn test_from_log_rejects_other_topics_and_pending_logs() {
        assert!(SourceEvent::from_log(&ping_log(Some(1), Some(0), abi::PONG_TOPIC)).is_err());
        assert!(SourceEvent::from_log(&ping_log(None, Some(0), abi::PING_TOPIC)).is_err());
        assert!(SourceEvent::from_log(&ping_log(Some(1), None, abi::PING_TOPIC)).is_err());
    }

    #[test]
    fn test_fee_params_max_is_componentwise() {
        let a = FeeParams::new(10, 1);
        let b = FeeParams::new(5, 3);
        assert_eq!(a.max(b), FeeParams::new(10, 3));
        assert_eq!(FeeParams::from_gwei(5, 2), FeeParams::new(5_000_000_000, 2_000_000_000));
    }
}
