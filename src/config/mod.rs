use crate::health::HealthConfig;
use crate::limiter::RateLimitConfig;
use crate::onchain::FeeParams;
use crate::reconcile::{FeePolicy, ReconcileConfig};

use alloy::primitives::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint - env HTTP_PROVIDER_URL
    #[serde(default)]
    pub http_url: String,
    /// WebSocket endpoint for the push subscription - env WEBSOCKET_PROVIDER_URL
    #[serde(default)]
    pub ws_url: String,
    /// Ping-pong contract - env CONTRACT_ADDRESS
    #[serde(default)]
    pub contract_address: String,
    /// Wallet key, hex - env PRIVATE_KEY only, never read from the file
    #[serde(skip)]
    pub private_key: String,
    /// First block to react to on a fresh data dir - env STARTING_BLOCK
    #[serde(default)]
    pub starting_block: Option<u64>,
}

impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("http_url", &self.http_url)
            .field("ws_url", &self.ws_url)
            .field("contract_address", &self.contract_address)
            .field("private_key", &"<redacted>")
            .field("starting_block", &self.starting_block)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Calls available at startup.
    #[serde(default = "default_reservoir")]
    pub reservoir: u32,
    /// Reservoir level restored every refresh interval.
    #[serde(default = "default_reservoir")]
    pub refresh_amount: u32,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Minimum gap between two outbound calls.
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Sweep interval in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Age in seconds after which an unmined pong is escalated.
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
    /// Speed-ups before a cancel.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_speed_up_multiplier")]
    pub speed_up_multiplier: f64,
    #[serde(default = "default_cancel_multiplier")]
    pub cancel_multiplier: f64,
    /// Fees used when the node has no estimate.
    #[serde(default = "default_floor_max_fee")]
    pub floor_max_fee_gwei: u64,
    #[serde(default = "default_floor_priority_fee")]
    pub floor_priority_fee_gwei: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Poll interval in seconds while degraded.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max blocks per log query.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, also write a per-run log file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_reservoir() -> u32 {
    10
}
fn default_refresh_interval_ms() -> u64 {
    1_000
}
fn default_min_spacing_ms() -> u64 {
    50
}
fn default_reconcile_interval() -> u64 {
    30
}
fn default_pending_timeout() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    5
}
fn default_speed_up_multiplier() -> f64 {
    1.25
}
fn default_cancel_multiplier() -> f64 {
    2.0
}
fn default_floor_max_fee() -> u64 {
    5
}
fn default_floor_priority_fee() -> u64 {
    2
}
fn default_poll_interval() -> u64 {
    20
}
fn default_max_block_range() -> u64 {
    2_000
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_heartbeat_timeout() -> u64 {
    10
}
fn default_reconnect_delay() -> u64 {
    30
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            reservoir: default_reservoir(),
            refresh_amount: default_reservoir(),
            refresh_interval_ms: default_refresh_interval_ms(),
            min_spacing_ms: default_min_spacing_ms(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            pending_timeout_secs: default_pending_timeout(),
            max_attempts: default_max_attempts(),
            speed_up_multiplier: default_speed_up_multiplier(),
            cancel_multiplier: default_cancel_multiplier(),
            floor_max_fee_gwei: default_floor_max_fee(),
            floor_priority_fee_gwei: default_floor_priority_fee(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_block_range: default_max_block_range(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus environment variables (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay settings found through `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("PRIVATE_KEY") {
            self.chain.private_key = key.trim().to_string();
        }
        if let Some(url) = get("HTTP_PROVIDER_URL") {
            self.chain.http_url = url;
        }
        if let Some(url) = get("WEBSOCKET_PROVIDER_URL") {
            self.chain.ws_url = url;
        }
        if let Some(addr) = get("CONTRACT_ADDRESS") {
            self.chain.contract_address = addr;
        }
        if let Some(block) = get("STARTING_BLOCK") {
            let block = block.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: "STARTING_BLOCK".into(),
                reason: e.to_string(),
            })?;
            self.chain.starting_block = Some(block);
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = get("DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Reject configurations the bot cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.private_key.is_empty() {
            return Err(ConfigError::Missing("PRIVATE_KEY".into()));
        }
        if self.chain.http_url.is_empty() {
            return Err(ConfigError::Missing("HTTP_PROVIDER_URL".into()));
        }
        if self.chain.ws_url.is_empty() {
            return Err(ConfigError::Missing("WEBSOCKET_PROVIDER_URL".into()));
        }
        self.contract_address()?;

        let invalid = |key: &str, reason: &str| ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        };
        if self.limiter.reservoir == 0 || self.limiter.refresh_amount == 0 {
            return Err(invalid("limiter.reservoir", "rate budget must be non-zero"));
        }
        if self.limiter.refresh_interval_ms == 0 {
            return Err(invalid("limiter.refresh_interval_ms", "must be non-zero"));
        }
        if self.reconciler.interval_secs == 0 || self.ingest.poll_interval_secs == 0 {
            return Err(invalid("interval", "task intervals must be non-zero"));
        }
        if self.ingest.max_block_range == 0 {
            return Err(invalid("ingest.max_block_range", "must be non-zero"));
        }
        if self.reconciler.speed_up_multiplier < 1.0 || self.reconciler.cancel_multiplier < 1.0 {
            return Err(invalid("reconciler multipliers", "must be at least 1.0"));
        }
        Ok(())
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        if self.chain.contract_address.is_empty() {
            return Err(ConfigError::Missing("CONTRACT_ADDRESS".into()));
        }
        self.chain
            .contract_address
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid {
                key: "CONTRACT_ADDRESS".into(),
                reason: format!("{e}"),
            })
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            reservoir: self.limiter.reservoir,
            refresh_amount: self.limiter.refresh_amount,
            refresh_interval: Duration::from_millis(self.limiter.refresh_interval_ms),
            min_spacing: Duration::from_millis(self.limiter.min_spacing_ms),
        }
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::new(
            FeeParams::from_gwei(
                self.reconciler.floor_max_fee_gwei,
                self.reconciler.floor_priority_fee_gwei,
            ),
            self.reconciler.speed_up_multiplier,
            self.reconciler.cancel_multiplier,
        )
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            pending_timeout: Duration::from_secs(self.reconciler.pending_timeout_secs),
            max_attempts: self.reconciler.max_attempts,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.interval_secs)
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            heartbeat_interval: Duration::from_secs(self.health.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.health.heartbeat_timeout_secs),
            reconnect_delay: Duration::from_secs(self.health.reconnect_delay_secs),
            poll_interval: Duration::from_secs(self.ingest.poll_interval_secs),
        }
    }
}
