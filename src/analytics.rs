//! Flag query analytics.
//!
//! Every flag query bumps a per-flag counter. A background timer uploads the counters
//! periodically; counts survive failed uploads (and, with a [`FileLedgerStore`], restarts) until
//! an upload succeeds.
use std::{
    collections::{hash_map::Entry, HashMap},
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    runtime::Handle,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Flag name → number of queries since the last successful upload.
pub type AnalyticsLedger = HashMap<String, u64>;

/// Durable storage for the [`AnalyticsLedger`].
pub trait LedgerStore: Send + Sync {
    /// Load the stored ledger. A store that has never been written returns an empty ledger.
    fn load(&self) -> Result<AnalyticsLedger>;
    /// Replace the stored ledger.
    fn save(&self, ledger: &AnalyticsLedger) -> Result<()>;
}

/// [`LedgerStore`] that keeps the ledger in memory only.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<AnalyticsLedger>,
}

impl MemoryLedgerStore {
    #[allow(missing_docs)]
    pub fn new() -> MemoryLedgerStore {
        MemoryLedgerStore::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<AnalyticsLedger> {
        Ok(self
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic")
            .clone())
    }

    fn save(&self, ledger: &AnalyticsLedger) -> Result<()> {
        *self
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic") = ledger.clone();
        Ok(())
    }
}

/// [`LedgerStore`] persisting the ledger as a JSON object in a file.
///
/// Writes go to a temporary file next to `path` which is then renamed over it, so a crash never
/// leaves a half-written ledger behind.
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    path: PathBuf,
}

impl FileLedgerStore {
    #[allow(missing_docs)]
    pub fn new(path: impl Into<PathBuf>) -> FileLedgerStore {
        FileLedgerStore { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tmp.into()
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> Result<AnalyticsLedger> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(AnalyticsLedger::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, ledger: &AnalyticsLedger) -> Result<()> {
        let tmp = self.tmp_path();
        std::fs::write(&tmp, serde_json::to_vec(ledger)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Uploads a ledger to the analytics endpoint.
#[async_trait]
pub trait AnalyticsUploader: Send + Sync {
    /// Upload `ledger`. On error the ledger is kept and retried on the next flush.
    async fn upload(&self, ledger: &AnalyticsLedger) -> Result<()>;
}

/// Counts flag queries and flushes them periodically.
pub struct AnalyticsBatcher {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Mutex<AnalyticsLedger>,
    store: Arc<dyn LedgerStore>,
    /// Serializes store writes so the last write always carries the latest counts.
    persist_lock: Mutex<()>,
    persist_pending: AtomicBool,
    uploader: Arc<dyn AnalyticsUploader>,
    enabled: AtomicBool,
    /// Serializes flushes so two uploads never carry the same counts.
    flush_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Timer>,
}

struct Timer {
    period: Duration,
    cancel: Option<CancellationToken>,
}

impl AnalyticsBatcher {
    /// Create a batcher, restoring counts left in `store` by a previous run.
    ///
    /// A zero `flush_period` disables periodic flushing; [`AnalyticsBatcher::flush`] still works.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        uploader: Arc<dyn AnalyticsUploader>,
        enabled: bool,
        flush_period: Duration,
    ) -> AnalyticsBatcher {
        let ledger = store.load().unwrap_or_else(|err| {
            log::warn!(target: "flagsync", "failed to load analytics ledger, starting empty: {err}");
            AnalyticsLedger::new()
        });

        AnalyticsBatcher {
            inner: Arc::new(Inner {
                ledger: Mutex::new(ledger),
                store,
                persist_lock: Mutex::new(()),
                persist_pending: AtomicBool::new(false),
                uploader,
                enabled: AtomicBool::new(enabled),
                flush_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(Timer {
                    period: flush_period,
                    cancel: None,
                }),
            }),
        }
    }

    /// Count one query of `flag_name`. Does nothing while analytics is disabled.
    ///
    /// Only the in-memory counter is touched here. The ledger is saved to the store on a blocking
    /// thread, with saves requested in the meantime folded into one.
    pub fn track_query(&self, flag_name: &str) {
        if !self.is_enabled() {
            return;
        }
        self.inner.update_ledger(|ledger| {
            *ledger.entry(flag_name.to_owned()).or_insert(0) += 1;
        });
    }

    /// Current counts.
    pub fn counts(&self) -> AnalyticsLedger {
        self.inner
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic")
            .clone()
    }

    /// Upload current counts now.
    ///
    /// Does nothing when disabled or when there is nothing to upload.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    #[allow(missing_docs)]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Turn analytics on or off. Turning it off stops the flush timer; counts already recorded are
    /// kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            self.ensure_running();
        } else {
            self.inner.stop_timer();
        }
    }

    /// Change the flush period. A running timer is cancelled and rescheduled.
    pub fn set_flush_period(&self, period: Duration) {
        let was_running = {
            let mut timer = self
                .inner
                .timer
                .lock()
                .expect("thread holding timer lock should not panic");
            if timer.period == period {
                return;
            }
            timer.period = period;
            timer.cancel.take().map(|cancel| cancel.cancel()).is_some()
        };
        if was_running {
            self.ensure_running();
        }
    }

    /// Start the flush timer if analytics is enabled and the timer is not running yet.
    ///
    /// The timer is spawned on the current tokio runtime. Outside of a runtime this does nothing;
    /// the next call from within one starts it.
    pub fn ensure_running(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut timer = self
            .inner
            .timer
            .lock()
            .expect("thread holding timer lock should not panic");
        if timer.cancel.is_some() || timer.period.is_zero() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            log::debug!(target: "flagsync", "no tokio runtime, analytics timer not started");
            return;
        };

        let cancel = CancellationToken::new();
        runtime.spawn(flush_periodically(
            self.inner.clone(),
            timer.period,
            cancel.clone(),
        ));
        log::debug!(target: "flagsync", period:? = timer.period; "analytics timer started");
        timer.cancel = Some(cancel);
    }
}

impl Drop for AnalyticsBatcher {
    fn drop(&mut self) {
        self.inner.stop_timer();
    }
}

impl Inner {
    /// Apply `f` to the ledger and schedule a save.
    fn update_ledger(self: &Arc<Self>, f: impl FnOnce(&mut AnalyticsLedger)) {
        f(&mut self
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic"));
        self.schedule_persist();
    }

    fn schedule_persist(self: &Arc<Self>) {
        if self.persist_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn_blocking(move || inner.persist());
            }
            // No executor to stall, so saving in place is fine.
            Err(_) => self.persist(),
        }
    }

    /// Save the current ledger. Blocks on store I/O.
    fn persist(&self) {
        let _persisting = self
            .persist_lock
            .lock()
            .expect("thread holding persist lock should not panic");
        self.persist_pending.store(false, Ordering::Release);
        let ledger = self
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic")
            .clone();
        if let Err(err) = self.store.save(&ledger) {
            log::warn!(target: "flagsync", "failed to persist analytics ledger: {err}");
        }
    }

    async fn persist_now(self: &Arc<Self>) {
        let inner = self.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || inner.persist()).await {
            log::warn!(target: "flagsync", "analytics ledger save did not complete: {err}");
        }
    }

    async fn flush(self: &Arc<Self>) -> Result<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let _flushing = self.flush_lock.lock().await;

        let uploading = self
            .ledger
            .lock()
            .expect("thread holding ledger lock should not panic")
            .clone();
        if uploading.is_empty() {
            return Ok(());
        }
        // Everything about to be uploaded is on disk before the upload can succeed.
        if self.persist_pending.load(Ordering::Acquire) {
            self.persist_now().await;
        }

        log::debug!(target: "flagsync", flags = uploading.len(); "uploading analytics");
        if let Err(err) = self.uploader.upload(&uploading).await {
            log::warn!(target: "flagsync", "failed to upload analytics, will retry: {err}");
            return Err(err);
        }

        subtract(
            &mut self
                .ledger
                .lock()
                .expect("thread holding ledger lock should not panic"),
            &uploading,
        );
        self.persist_now().await;
        Ok(())
    }

    fn stop_timer(&self) {
        let cancel = self
            .timer
            .lock()
            .expect("thread holding timer lock should not panic")
            .cancel
            .take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }
}

/// Remove `uploaded` counts from `ledger`, keeping anything counted since the upload started.
fn subtract(ledger: &mut AnalyticsLedger, uploaded: &AnalyticsLedger) {
    for (name, count) in uploaded {
        if let Entry::Occupied(mut entry) = ledger.entry(name.clone()) {
            let remaining = entry.get().saturating_sub(*count);
            if remaining == 0 {
                entry.remove();
            } else {
                entry.insert(remaining);
            }
        }
    }
}

async fn flush_periodically(inner: Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let mut interval = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Errors are logged by flush and retried on the next tick.
        let _ = inner.flush().await;
    }
    log::debug!(target: "flagsync", "analytics timer stopped");
}
