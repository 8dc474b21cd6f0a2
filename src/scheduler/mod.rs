//! Stoppable periodic tasks.
//!
//! A `PeriodicTask` runs its job on a fixed interval in a background tokio
//! task. It can be stopped and started again any number of times (the poll
//! loop is toggled on every Live/Degraded transition).
//!
//! Guarantees:
//! - a job never overlaps its own previous run: ticks missed while a run is
//!   in progress are skipped, and a restarted loop waits for a run left over
//!   from before the stop;
//! - `stop()` never interrupts a run in progress, it only prevents the next.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    initial_delay: Duration,
    job: Job,
    /// Held for the duration of each run.
    run_guard: Arc<tokio::sync::Mutex<()>>,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: &'static str, period: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            period,
            initial_delay: Duration::ZERO,
            job: Arc::new(move || job().boxed()),
            run_guard: Arc::new(tokio::sync::Mutex::new(())),
            running: Mutex::new(None),
        }
    }

    /// Delay the first run. By default the first run starts immediately.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start the loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.name,
            self.period,
            self.initial_delay,
            self.job.clone(),
            self.run_guard.clone(),
            stop_rx,
        ));
        *running = Some(Running { stop_tx, handle });
        info!(task = self.name, period_ms = self.period.as_millis() as u64, "periodic task started");
        true
    }

    /// Stop the loop after the current run (if any). Returns `false` if it
    /// was not running.
    pub fn stop(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.take() {
            Some(r) => {
                let _ = r.stop_tx.send(true);
                info!(task = self.name, "periodic task stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    name: &'static str,
    period: Duration,
    initial_delay: Duration,
    job: Job,
    run_guard: Arc<tokio::sync::Mutex<()>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = interval_at(Instant::now() + initial_delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let _guard = run_guard.lock().await;
                if *stop_rx.borrow() {
                    break;
                }
                job().await;
            }
        }
    }
    debug!(task = name, "periodic loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(period_ms: u64, counter: Arc<AtomicUsize>) -> PeriodicTask {
        PeriodicTask::new("test", Duration::from_millis(period_ms), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_is_immediate_then_periodic() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(1_000, counter.clone());
        assert!(task.start());
        assert!(!task.start());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_restart() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(1_000, counter.clone());
        task.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.stop());
        assert!(!task.stop());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());

        assert!(task.start());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(1_000, counter.clone()).with_initial_delay(Duration::from_secs(30));
        task.start();
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, p, r) = (active.clone(), peak.clone(), runs.clone());
        let task = PeriodicTask::new("slow", Duration::from_millis(100), move || {
            let (a, p, r) = (a.clone(), p.clone(), r.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(350)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Stop mid-run and restart straight away: the new loop must wait.
        task.stop();
        task.start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }
}
