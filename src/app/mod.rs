//! Process wiring.
//!
//! `AppContext` holds the handles every component shares (chain client,
//! rate limiter, nonce allocator, ledger) and is passed into each
//! constructor explicitly.
//! `App` owns the long-running pieces and runs them in startup order:
//!
//! 1. one reconcile sweep over whatever was pending at shutdown
//! 2. the health monitor: connect push (or go degraded), catch-up poll,
//!    then consume push events
//! 3. the periodic reconcile task, first tick one interval in

use crate::config::Config;
use crate::health::{ConnectionMode, HealthConfig, HealthMonitor};
use crate::ingest::Ingestor;
use crate::ledger::SharedLedger;
use crate::limiter::{RateLimitConfig, RateLimiter};
use crate::onchain::{ChainClient, PushConnector};
use crate::reactor::{NonceAllocator, Submitter};
use crate::reconcile::{FeePolicy, ReconcileConfig, Reconciler};
use crate::scheduler::PeriodicTask;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct AppContext {
    pub chain: Arc<dyn ChainClient>,
    pub limiter: Arc<RateLimiter>,
    pub nonces: Arc<NonceAllocator>,
    pub ledger: SharedLedger,
}

impl AppContext {
    pub fn new(chain: Arc<dyn ChainClient>, rate_limit: RateLimitConfig, ledger: SharedLedger) -> Self {
        let limiter = Arc::new(RateLimiter::new(rate_limit));
        Self {
            nonces: Arc::new(NonceAllocator::new(chain.clone(), limiter.clone())),
            chain,
            limiter,
            ledger,
        }
    }
}

/// Tunables for the running components.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub fees: FeePolicy,
    pub reconcile: ReconcileConfig,
    pub reconcile_interval: Duration,
    pub health: HealthConfig,
    pub max_block_range: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            fees: FeePolicy::default(),
            reconcile: ReconcileConfig::default(),
            reconcile_interval: Duration::from_secs(30),
            health: HealthConfig::default(),
            max_block_range: 2_000,
        }
    }
}

impl From<&Config> for AppSettings {
    fn from(config: &Config) -> Self {
        Self {
            fees: config.fee_policy(),
            reconcile: config.reconcile(),
            reconcile_interval: config.reconcile_interval(),
            health: config.health(),
            max_block_range: config.ingest.max_block_range,
        }
    }
}

pub struct App {
    reconciler: Arc<Reconciler>,
    reconcile_task: PeriodicTask,
    health: HealthMonitor,
}

impl App {
    pub fn new(ctx: AppContext, connector: Arc<dyn PushConnector>, settings: AppSettings) -> Self {
        let submitter = Submitter::new(
            ctx.chain.clone(),
            ctx.limiter.clone(),
            ctx.nonces.clone(),
            ctx.ledger.clone(),
            settings.fees,
        );
        let ingestor = Arc::new(Ingestor::new(
            ctx.chain.clone(),
            ctx.limiter.clone(),
            ctx.ledger.clone(),
            submitter,
            settings.max_block_range,
        ));
        let reconciler = Arc::new(Reconciler::new(
            ctx.chain.clone(),
            ctx.limiter.clone(),
            ctx.nonces.clone(),
            ctx.ledger.clone(),
            settings.fees,
            settings.reconcile,
        ));

        let sweeper = reconciler.clone();
        let reconcile_task = PeriodicTask::new("reconcile", settings.reconcile_interval, move || {
            let reconciler = sweeper.clone();
            async move {
                reconciler.sweep().await;
            }
        })
        .with_initial_delay(settings.reconcile_interval);

        let health = HealthMonitor::new(connector, ingestor, settings.health);

        Self {
            reconciler,
            reconcile_task,
            health,
        }
    }

    pub fn mode(&self) -> watch::Receiver<ConnectionMode> {
        self.health.watch_mode()
    }

    /// Run until the future is dropped.
    pub async fn run(&self) {
        let report = self.reconciler.sweep().await;
        info!(%report, "startup sweep done");

        self.reconcile_task.start();
        self.health.run().await;
    }
}
