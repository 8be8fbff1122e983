use super::replicator::{DatasetRestore, SaveReport, SnapshotReplicator};
use crate::core::{FeedReference, LedgerError, Result};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, warn};

/// What a [`SaveScheduler::safe_save`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// A save was started.
    Started,
    /// A save is running; another one will follow it.
    Queued,
    /// Too soon after the last save; a timer will start one.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub executed: u64,
    pub queued: u64,
    pub deferred: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct SaveState {
    is_saving: bool,
    pending: bool,
    deferred: bool,
    last_started: Option<Instant>,
}

impl SaveState {
    fn is_idle(&self) -> bool {
        !(self.is_saving || self.pending || self.deferred)
    }
}

/// Throttled, single-flight front end to [`SnapshotReplicator::save`].
///
/// Save requests are never dropped: a request during a save is folded into
/// one follow-up save, and a request too close to the previous save is
/// delayed until `min_interval` has passed.
pub struct SaveScheduler {
    replicator: Arc<SnapshotReplicator>,
    min_interval: Duration,
    state: Mutex<SaveState>,
    flight: AsyncMutex<()>,
    idle: Notify,
    last_report: Mutex<Option<SaveReport>>,
    executed: AtomicU64,
    queued: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
}

impl SaveScheduler {
    pub fn new(replicator: Arc<SnapshotReplicator>, min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            replicator,
            min_interval,
            state: Mutex::new(SaveState::default()),
            flight: AsyncMutex::new(()),
            idle: Notify::new(),
            last_report: Mutex::new(None),
            executed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn replicator(&self) -> &Arc<SnapshotReplicator> {
        &self.replicator
    }

    fn state(&self) -> MutexGuard<'_, SaveState> {
        // The state is a handful of flags; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests a save. Returns immediately; the save runs on a spawned task.
    pub fn safe_save(self: &Arc<Self>) -> SaveTrigger {
        let mut state = self.state();
        self.trigger(&mut state)
    }

    fn trigger(self: &Arc<Self>, state: &mut SaveState) -> SaveTrigger {
        if state.is_saving {
            state.pending = true;
            self.queued.fetch_add(1, AtomicOrdering::Relaxed);
            return SaveTrigger::Queued;
        }
        if state.deferred {
            self.deferred.fetch_add(1, AtomicOrdering::Relaxed);
            return SaveTrigger::Deferred;
        }

        let now = Instant::now();
        if let Some(last) = state.last_started {
            let since = now.saturating_duration_since(last);
            if since < self.min_interval {
                state.deferred = true;
                self.deferred.fetch_add(1, AtomicOrdering::Relaxed);
                let wait = self.min_interval - since;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(wait).await;
                    this.fire_deferred();
                });
                debug!(wait_ms = wait.as_millis() as u64, "save deferred");
                return SaveTrigger::Deferred;
            }
        }

        state.is_saving = true;
        state.last_started = Some(now);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_save().await;
        });
        SaveTrigger::Started
    }

    fn fire_deferred(self: &Arc<Self>) {
        let mut state = self.state();
        state.deferred = false;
        self.trigger(&mut state);
    }

    async fn run_save(self: Arc<Self>) {
        {
            let _flight = self.flight.lock().await;
            if let Err(err) = self.execute().await {
                error!(error = %err, "snapshot save failed; the next trigger retries");
            }
        }

        {
            let mut state = self.state();
            state.is_saving = false;
            if std::mem::take(&mut state.pending) {
                self.trigger(&mut state);
            }
        }
        self.idle.notify_waiters();
    }

    async fn execute(&self) -> Result<SaveReport> {
        self.executed.fetch_add(1, AtomicOrdering::Relaxed);
        match self.replicator.save().await {
            Ok(report) => {
                if report.is_clean() {
                    info!(
                        published = report.published.len(),
                        publishes = report.publishes,
                        "snapshot save finished"
                    );
                } else {
                    warn!(summary = %report, "snapshot save finished with skipped datasets");
                }
                *self.last_report.lock()? = Some(report.clone());
                Ok(report)
            }
            Err(err) => {
                self.failed.fetch_add(1, AtomicOrdering::Relaxed);
                Err(err)
            }
        }
    }

    /// Saves right away, waiting for any save in flight to finish first.
    pub async fn save_now(&self) -> Result<SaveReport> {
        let _flight = self.flight.lock().await;
        self.state().last_started = Some(Instant::now());
        self.execute().await
    }

    /// Restores one dataset while no save is in flight.
    pub async fn restore_one(&self, dataset: &str, reference: Option<&FeedReference>) -> Result<DatasetRestore> {
        let _flight = self.flight.lock().await;
        self.replicator.restore_one(dataset, reference).await
    }

    /// Resolves once no save is running, queued or deferred.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> SaveStats {
        SaveStats {
            executed: self.executed.load(AtomicOrdering::Relaxed),
            queued: self.queued.load(AtomicOrdering::Relaxed),
            deferred: self.deferred.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn last_report(&self) -> Result<Option<SaveReport>> {
        Ok(self.last_report.lock()?.clone())
    }
}

/// Background task calling [`SaveScheduler::safe_save`] on a fixed period.
pub struct BackgroundSaver {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundSaver {
    /// Signals the saver to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| LedgerError::ExecutionError(format!("background saver join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for BackgroundSaver {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub fn spawn_background_saver(scheduler: Arc<SaveScheduler>, period: Duration) -> BackgroundSaver {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(period) => {
                    let trigger = scheduler.safe_save();
                    debug!(?trigger, "background save tick");
                }
            }
        }
    });

    BackgroundSaver {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
