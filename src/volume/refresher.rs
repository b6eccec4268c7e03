//! Background loop that keeps the volume cache warm for the codes of interest.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::FetchError;
use crate::volume::cache::VolumeCache;
use crate::volume::fetcher::VolumeFetcher;

/// Supplies the codes to refresh, e.g. whatever is currently subscribed.
pub type CodeSupplier = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RefresherSettings {
    pub interval: Duration,
    pub ttl: Duration,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RefresherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ttl: Duration::from_secs(10),
            concurrency: 4,
            fetch_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub requested: usize,
    pub updated: usize,
    /// Snapshots with no volume data; not written.
    pub empty: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

enum FetchOutcome {
    Updated,
    Empty,
    Failed,
}

#[derive(Clone)]
struct RefreshCycle {
    fetcher: Arc<dyn VolumeFetcher>,
    cache: Arc<VolumeCache>,
    supplier: CodeSupplier,
    settings: RefresherSettings,
    last_report: Arc<Mutex<Option<CycleReport>>>,
    // Held for a whole cycle so background and on-demand runs never overlap.
    running: Arc<AsyncMutex<()>>,
}

impl RefreshCycle {
    fn codes_of_interest(&self) -> Vec<String> {
        let codes: BTreeSet<String> = (self.supplier)()
            .into_iter()
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
            .collect();
        codes.into_iter().collect()
    }

    async fn refresh_code(&self, code: String) -> FetchOutcome {
        let result = match timeout(self.settings.fetch_timeout, self.fetcher.fetch(&code)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.settings.fetch_timeout)),
        };

        match result {
            Ok(snapshot) if snapshot.is_empty() => {
                debug!("No volume data for {}, keeping cache as is", code);
                FetchOutcome::Empty
            }
            Ok(snapshot) => {
                self.cache.store_snapshot(&code, snapshot, self.settings.ttl);
                FetchOutcome::Updated
            }
            Err(e) => {
                warn!("Volume fetch for {} failed: {}", code, e);
                FetchOutcome::Failed
            }
        }
    }

    async fn run(&self) -> CycleReport {
        let _running = self.running.lock().await;
        let started_at = Utc::now();
        let started = Instant::now();
        let codes = self.codes_of_interest();
        let requested = codes.len();

        let outcomes: Vec<FetchOutcome> = stream::iter(codes)
            .map(|code| self.refresh_code(code))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = CycleReport {
            requested,
            updated: 0,
            empty: 0,
            failed: 0,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        for outcome in outcomes {
            match outcome {
                FetchOutcome::Updated => report.updated += 1,
                FetchOutcome::Empty => report.empty += 1,
                FetchOutcome::Failed => report.failed += 1,
            }
        }

        if report.requested > 0 {
            debug!(
                "Volume refresh: {} requested, {} updated, {} empty, {} failed in {}ms",
                report.requested, report.updated, report.empty, report.failed, report.elapsed_ms
            );
        }

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }
}

struct RefresherTask {
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
}

pub struct VolumeRefresher {
    cycle: RefreshCycle,
    task: Mutex<Option<RefresherTask>>,
}

impl VolumeRefresher {
    pub fn new(
        fetcher: Arc<dyn VolumeFetcher>,
        cache: Arc<VolumeCache>,
        supplier: CodeSupplier,
        settings: RefresherSettings,
    ) -> Self {
        Self {
            cycle: RefreshCycle {
                fetcher,
                cache,
                supplier,
                settings,
                last_report: Arc::new(Mutex::new(None)),
                running: Arc::new(AsyncMutex::new(())),
            },
            task: Mutex::new(None),
        }
    }

    /// Launches the background loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = task.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Volume refresher already running");
                return false;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cycle = self.cycle.clone();
        let handle = tokio::spawn(Self::run_loop(cycle, cancel_rx));
        *task = Some(RefresherTask { handle, cancel_tx });

        info!(
            "Started volume refresher (every {:?}, TTL {:?}, {} parallel fetches)",
            self.cycle.settings.interval, self.cycle.settings.ttl, self.cycle.settings.concurrency
        );
        true
    }

    async fn run_loop(cycle: RefreshCycle, mut cancel_rx: watch::Receiver<bool>) {
        let mut timer = interval(cycle.settings.interval);
        // A slow cycle pushes the next one back instead of bunching them up.
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = timer.tick() => {}
            }

            tokio::select! {
                _ = cancel_rx.changed() => {
                    info!("Volume refresher stopping mid-cycle");
                    break;
                }
                _ = cycle.run() => {}
            }
        }

        info!("Volume refresher loop exited");
    }

    /// Signals the loop to exit and waits up to the shutdown grace period.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(RefresherTask { mut handle, cancel_tx }) = task else {
            return;
        };

        let _ = cancel_tx.send(true);
        let grace = self.cycle.settings.shutdown_grace;
        if timeout(grace, &mut handle).await.is_err() {
            warn!("Volume refresher did not stop within {:?}, aborting", grace);
            handle.abort();
        }
    }

    /// Runs one cycle on the caller's task, after any cycle already in progress.
    pub async fn refresh_now(&self) -> CycleReport {
        self.cycle.run().await
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.cycle
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn settings(&self) -> &RefresherSettings {
        &self.cycle.settings
    }
}
