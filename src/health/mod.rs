//! Connection health monitor: keeps the push channel alive and falls back to
//! polling while it is not.
//!
//! ```text
//!            connect + probe + subscribe ok
//!   Degraded ─────────────────────────────▶ Live
//!      ▲   (catch-up poll, stop poll task)   │
//!      │                                     │ stream closed / probe failed
//!      └─────────────────────────────────────┘ / probe timed out
//!        (drop stream, start poll task,
//!         retry after a fixed delay)
//! ```
//!
//! The reconnect delay is fixed; attempts continue indefinitely.
//!
//! A subscription can also lose events without ending, e.g. when the
//! transport reconnects underneath it. Every push batch is gap-checked on
//! admission and every successful heartbeat runs one poll, so such losses
//! are recovered within one heartbeat.

use crate::ingest::Ingestor;
use crate::onchain::{ChainError, PushChannel, PushConnector, SourceEventStream};
use crate::scheduler::PeriodicTask;

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Max push events admitted as one sorted batch.
const PUSH_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Push subscription active, polling stopped.
    Live,
    /// Polling fallback active, reconnect pending.
    Degraded,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Live => write!(f, "live"),
            ConnectionMode::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
enum Disconnect {
    StreamClosed,
    Heartbeat(String),
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::StreamClosed => write!(f, "push stream closed"),
            Disconnect::Heartbeat(reason) => write!(f, "heartbeat failed: {reason}"),
        }
    }
}

pub struct HealthMonitor {
    connector: Arc<dyn PushConnector>,
    ingestor: Arc<Ingestor>,
    poller: PeriodicTask,
    config: HealthConfig,
    mode: watch::Sender<ConnectionMode>,
}

impl HealthMonitor {
    /// Starts out Degraded; nothing runs until `run` is called.
    pub fn new(
        connector: Arc<dyn PushConnector>,
        ingestor: Arc<Ingestor>,
        config: HealthConfig,
    ) -> Self {
        let poll_ingestor = ingestor.clone();
        let poller = PeriodicTask::new("poll", config.poll_interval, move || {
            let ingestor = poll_ingestor.clone();
            async move { ingestor.poll_tick().await }
        });
        let (mode, _) = watch::channel(ConnectionMode::Degraded);
        Self {
            connector,
            ingestor,
            poller,
            config,
            mode,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.mode.borrow()
    }

    pub fn watch_mode(&self) -> watch::Receiver<ConnectionMode> {
        self.mode.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    fn set_mode(&self, mode: ConnectionMode) {
        self.mode.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        });
    }

    /// Drive the state machine forever.
    pub async fn run(&self) {
        loop {
            match self.establish().await {
                Ok((channel, stream)) => {
                    // Close the gap between the last poll and the new
                    // subscription before polling stops.
                    if let Err(e) = self.ingestor.poll_once().await {
                        warn!(error = %e, "catch-up poll failed");
                    }
                    self.poller.stop();
                    self.set_mode(ConnectionMode::Live);
                    info!("push channel live");

                    let reason = self.run_live(channel, stream).await;
                    warn!(%reason, "push channel lost, unsubscribed");
                }
                Err(e) => {
                    warn!(error = %e, "push channel unavailable");
                }
            }

            self.enter_degraded();
            sleep(self.config.reconnect_delay).await;
            info!("attempting push reconnect");
        }
    }

    fn enter_degraded(&self) {
        self.set_mode(ConnectionMode::Degraded);
        if self.poller.start() {
            info!(
                retry_in_secs = self.config.reconnect_delay.as_secs(),
                "degraded: polling fallback active"
            );
        }
    }

    async fn establish(&self) -> Result<(Arc<dyn PushChannel>, SourceEventStream), ChainError> {
        let channel = self.connector.connect().await?;
        let head = self
            .probe(&channel)
            .await
            .map_err(ChainError::Transport)?;
        let stream = channel.subscribe().await?;
        debug!(head, "push channel verified and subscribed");
        Ok((channel, stream))
    }

    /// Probe `channel`, waiting at most the heartbeat timeout. The probe
    /// runs in its own task, so a timeout leaves it running rather than
    /// aborting it.
    async fn probe(&self, channel: &Arc<dyn PushChannel>) -> Result<u64, String> {
        let channel = channel.clone();
        let probe = tokio::spawn(async move { channel.probe().await });
        match timeout(self.config.heartbeat_timeout, probe).await {
            Ok(Ok(Ok(head))) => Ok(head),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(format!("probe task failed: {e}")),
            Err(_) => Err(format!(
                "no response within {}ms",
                self.config.heartbeat_timeout.as_millis()
            )),
        }
    }

    /// Consume push events and heartbeat the channel until one of them
    /// fails. Admission of a batch always runs to completion.
    async fn run_live(
        &self,
        channel: Arc<dyn PushChannel>,
        stream: SourceEventStream,
    ) -> Disconnect {
        let mut batches = stream.ready_chunks(PUSH_BATCH);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                batch = batches.next() => match batch {
                    Some(events) => {
                        self.ingestor.admit_push(events).await;
                    }
                    None => return Disconnect::StreamClosed,
                },
                _ = heartbeat.tick() => {
                    match self.probe(&channel).await {
                        Ok(head) => {
                            debug!(head, "heartbeat ok");
                            if let Err(e) = self.ingestor.poll_once().await {
                                warn!(error = %e, "heartbeat gap poll failed");
                            }
                        }
                        Err(reason) => return Disconnect::Heartbeat(reason),
                    }
                }
            }
        }
    }
}
