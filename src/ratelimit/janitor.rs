//! Background eviction of expired local windows.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::clock::Clock;
use super::local::LocalWindowStore;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically sweeps a [`LocalWindowStore`].
///
/// The task is owned by the janitor: it runs between [`start`](Janitor::start)
/// and [`stop`](Janitor::stop), and is aborted if the janitor is dropped while
/// it is still running.
pub struct Janitor {
    store: Arc<LocalWindowStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Janitor {
    pub fn new(store: Arc<LocalWindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_interval(store, clock, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_interval(
        store: Arc<LocalWindowStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawn the sweep task. Calling this while the task runs does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep(clock.now_millis());
                        debug!(removed, remaining = store.len(), "Swept expired rate limit windows");
                    }
                }
            }
        });

        info!(interval = ?period, "Rate limit janitor started");
        *running = Some(Running { shutdown, handle });
    }

    /// Signal the sweep task to finish and wait for it.
    pub async fn stop(&self) {
        let Some(Running { shutdown, handle }) = self.running.lock().take() else {
            return;
        };

        // The task may already have exited; either way it is joined below.
        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            debug!(error = %e, "Janitor task ended abnormally");
        }
        info!("Rate limit janitor stopped");
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.handle.abort();
        }
    }
}
