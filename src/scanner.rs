use chrono::Utc;
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::ai_client::AiClient;
use crate::config::ScannerConfig;
use crate::db::{crud, DbPool};
use crate::media_type;
use crate::metrics::metrics;
use crate::quarantine::{ErrorSidecar, Quarantine};
use crate::queue::{EnqueueOutcome, ProcessFileTask, TaskQueue};

/// A file we have seen but not yet declared stable.
#[derive(Debug, Clone)]
struct PendingEntry {
    size: u64,
    first_seen: Instant,
    last_change: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StabilityDecision {
    /// Still settling; check again next tick.
    Wait,
    /// Size unchanged for long enough; safe to hand off.
    Enqueue,
    /// Never settled within the stuck timeout; quarantine it.
    Stuck,
}

/// Applied to every pending entry on each poll tick. Notifications only
/// feed the pending set; this decision is the sole gate to the queue, so a
/// dropped or duplicated notification can never cause a premature enqueue.
fn decide_stability(
    remembered_size: u64,
    current_size: u64,
    now: Instant,
    entry: &PendingEntry,
    stability_threshold: Duration,
    stuck_timeout: Duration,
) -> StabilityDecision {
    let changed = current_size != remembered_size;
    if !changed && now.duration_since(entry.last_change) >= stability_threshold {
        return StabilityDecision::Enqueue;
    }
    if now.duration_since(entry.first_seen) >= stuck_timeout {
        return StabilityDecision::Stuck;
    }
    StabilityDecision::Wait
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScannerCounters {
    pub discovered: u64,
    pub queued: u64,
    pub skipped_duplicate: u64,
    pub skipped_unsupported: u64,
    pub skipped_unstable: u64,
    pub fsnotify_create: u64,
    pub fsnotify_write: u64,
    pub fsnotify_remove: u64,
    pub fsnotify_rename: u64,
    pub fsnotify_other: u64,
    pub poll_scans: u64,
    pub queue_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub running: bool,
    pub watched_dirs: usize,
    pub pending_files: usize,
    pub counters: ScannerCounters,
}

#[derive(Debug, Default)]
struct ScannerState {
    pending: HashMap<PathBuf, PendingEntry>,
    counters: ScannerCounters,
    running: bool,
    watched_dirs: usize,
}

/// Watches the uploads tree and emits one ProcessFile task per file that is
/// supported and stable. Notifications are treated as hints: the polling
/// sweep finds everything they miss, which keeps network mounts working.
pub struct Scanner {
    uploads_root: PathBuf,
    config: ScannerConfig,
    queue: TaskQueue,
    quarantine: Quarantine,
    db: DbPool,
    ai: Option<AiClient>,
    state: Arc<RwLock<ScannerState>>,
    rescan: Notify,
}

impl Scanner {
    pub fn new(
        uploads_root: PathBuf,
        config: ScannerConfig,
        queue: TaskQueue,
        quarantine: Quarantine,
        db: DbPool,
        ai: Option<AiClient>,
    ) -> Self {
        Self {
            uploads_root,
            config,
            queue,
            quarantine,
            db,
            ai,
            state: Arc::new(RwLock::new(ScannerState::default())),
            rescan: Notify::new(),
        }
    }

    /// Spawns the notification listener and the polling loop.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scanner = self.clone();
        let events_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            scanner.run_event_loop(event_tx, event_rx, events_shutdown).await;
        }));

        handles.push(tokio::spawn(async move {
            self.run_poll_loop(shutdown).await;
        }));

        handles
    }

    /// Requests an immediate sweep, equivalent to one poll tick now.
    pub fn rescan_now(&self) {
        self.rescan.notify_one();
    }

    pub async fn status(&self) -> ScannerStatus {
        let state = self.state.read().await;
        ScannerStatus {
            running: state.running,
            watched_dirs: state.watched_dirs,
            pending_files: state.pending.len(),
            counters: state.counters.clone(),
        }
    }

    async fn run_event_loop(
        &self,
        event_tx: mpsc::UnboundedSender<Event>,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // The watcher callback runs on notify's thread; it only forwards
        // into the channel.
        let mut watcher = match RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => error!("File watch error: {}", e),
            },
            notify::Config::default(),
        ) {
            Ok(w) => w,
            Err(e) => {
                // Polling still covers the tree; degrade instead of dying.
                warn!("Could not create file watcher, relying on polling only: {}", e);
                return;
            }
        };

        if let Err(e) = watcher.watch(&self.uploads_root, RecursiveMode::Recursive) {
            warn!(
                "Could not watch {}, relying on polling only: {}",
                self.uploads_root.display(),
                e
            );
            return;
        }
        info!("Watching {} for changes", self.uploads_root.display());

        loop {
            tokio::select! {
                maybe = event_rx.recv() => match maybe {
                    Some(event) => self.handle_fs_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain whatever the watcher already delivered before dropping it.
        while let Ok(event) = event_rx.try_recv() {
            self.handle_fs_event(event).await;
        }
        debug!("Scanner event loop stopped");
    }

    async fn handle_fs_event(&self, event: Event) {
        let mut state = self.state.write().await;
        match &event.kind {
            EventKind::Create(_) => state.counters.fsnotify_create += 1,
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                state.counters.fsnotify_rename += 1
            }
            EventKind::Modify(_) => state.counters.fsnotify_write += 1,
            EventKind::Remove(_) => state.counters.fsnotify_remove += 1,
            _ => state.counters.fsnotify_other += 1,
        }

        for path in event.paths {
            match &event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    if !path.is_file() {
                        continue;
                    }
                    if !media_type::is_supported_file(&path) {
                        continue;
                    }
                    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    let now = Instant::now();
                    let is_new = !state.pending.contains_key(&path);
                    if is_new {
                        state.counters.discovered += 1;
                        metrics().scanner_files_discovered.inc();
                    }
                    upsert_pending(&mut state.pending, path, size, now);
                }
                EventKind::Remove(_) => {
                    state.pending.remove(&path);
                }
                _ => {}
            }
        }
    }

    async fn run_poll_loop(&self, mut shutdown: watch::Receiver<bool>) {
        {
            let mut state = self.state.write().await;
            state.running = true;
        }

        let mut tick = tokio::time::interval(self.config.scan_interval);
        // First tick fires immediately; that is the startup sweep.
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.rescan.notified() => {
                    info!("Manual rescan triggered");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.sweep().await;
            self.evaluate_pending().await;
        }

        let mut state = self.state.write().await;
        state.running = false;
        debug!("Scanner poll loop stopped");
    }

    /// Walks the whole tree and folds every regular file into the pending
    /// set. Files already known keep their arrival timestamps.
    async fn sweep(&self) {
        let mut watched_dirs = 0usize;
        let mut found: Vec<(PathBuf, u64)> = Vec::new();
        let mut unsupported = 0u64;

        for entry in WalkDir::new(&self.uploads_root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() {
                watched_dirs += 1;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if media_type::is_hidden(path) {
                continue;
            }
            if media_type::kind_from_path(path).is_none() {
                unsupported += 1;
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            found.push((path.to_path_buf(), size));
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        state.counters.poll_scans += 1;
        state.counters.skipped_unsupported += unsupported;
        state.watched_dirs = watched_dirs;

        for (path, size) in found {
            let is_new = !state.pending.contains_key(&path);
            if is_new {
                state.counters.discovered += 1;
                metrics().scanner_files_discovered.inc();
            }
            upsert_pending(&mut state.pending, path, size, now);
        }
    }

    /// The stability pass: enqueue what settled, keep what is still moving,
    /// quarantine what never settles.
    async fn evaluate_pending(&self) {
        let now = Instant::now();
        let snapshot: Vec<(PathBuf, PendingEntry)> = {
            let state = self.state.read().await;
            state
                .pending
                .iter()
                .map(|(p, e)| (p.clone(), e.clone()))
                .collect()
        };

        for (path, entry) in snapshot {
            let current_size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    // Gone between sweeps (processed, or user removed it).
                    let mut state = self.state.write().await;
                    state.pending.remove(&path);
                    continue;
                }
            };

            match decide_stability(
                entry.size,
                current_size,
                now,
                &entry,
                self.config.stability_threshold,
                self.config.stuck_file_timeout,
            ) {
                StabilityDecision::Wait => {
                    if current_size != entry.size {
                        let mut state = self.state.write().await;
                        upsert_pending(&mut state.pending, path, current_size, now);
                    }
                }
                StabilityDecision::Enqueue => {
                    self.enqueue_file(&path, current_size).await;
                    let mut state = self.state.write().await;
                    state.pending.remove(&path);
                }
                StabilityDecision::Stuck => {
                    warn!(
                        "{} never stabilized within {:?}, quarantining",
                        path.display(),
                        self.config.stuck_file_timeout
                    );
                    let sidecar = ErrorSidecar {
                        stage: "stability".to_string(),
                        error: format!(
                            "unstable: size still changing after {:?}",
                            self.config.stuck_file_timeout
                        ),
                        worker_id: "scanner".to_string(),
                        moved_at: Utc::now(),
                        attempts: 0,
                    };
                    if let Err(e) = self.quarantine.quarantine_file(&path, &sidecar) {
                        error!("Could not quarantine {}: {}", path.display(), e);
                    }
                    let mut state = self.state.write().await;
                    state.counters.skipped_unstable += 1;
                    state.pending.remove(&path);
                }
            }
        }
    }

    async fn enqueue_file(&self, path: &Path, size: u64) {
        // Ask the AI service to step aside before decode work starts.
        // Fire-and-forget: ingestion never waits for it.
        if let Some(ai) = &self.ai {
            ai.pause_best_effort();
        }

        let task = ProcessFileTask {
            file_path: path.to_string_lossy().to_string(),
            detected_at: Utc::now(),
            file_size: size as i64,
        };

        match self.queue.enqueue(&task).await {
            Ok(EnqueueOutcome::Enqueued) => {
                debug!("Enqueued {}", path.display());
                metrics().scanner_files_queued.inc();
                if let Err(e) = crud::processing_state_queued(&self.db, &task.file_path).await {
                    warn!("Could not record queued state for {}: {}", path.display(), e);
                }
                let mut state = self.state.write().await;
                state.counters.queued += 1;
            }
            Ok(EnqueueOutcome::Coalesced) => {
                let mut state = self.state.write().await;
                state.counters.skipped_duplicate += 1;
            }
            Err(e) => {
                error!("Enqueue failed for {}: {}", path.display(), e);
                let mut state = self.state.write().await;
                state.counters.queue_errors += 1;
                // Leave the entry pending; the next tick tries again.
            }
        }
    }
}

fn upsert_pending(
    pending: &mut HashMap<PathBuf, PendingEntry>,
    path: PathBuf,
    size: u64,
    now: Instant,
) {
    match pending.get_mut(&path) {
        Some(entry) => {
            if entry.size != size {
                entry.size = size;
                entry.last_change = now;
            }
        }
        None => {
            pending.insert(
                path,
                PendingEntry {
                    size,
                    first_seen: now,
                    last_change: now,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: Duration = Duration::from_secs(10);
    const STUCK: Duration = Duration::from_secs(300);

    fn entry(size: u64, first_seen_ago: Duration, last_change_ago: Duration) -> PendingEntry {
        let now = Instant::now();
        PendingEntry {
            size,
            first_seen: now - first_seen_ago,
            last_change: now - last_change_ago,
        }
    }

    #[test]
    fn test_fresh_file_waits() {
        let e = entry(100, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(
            decide_stability(100, 100, Instant::now(), &e, STABLE, STUCK),
            StabilityDecision::Wait
        );
    }

    #[test]
    fn test_stable_file_enqueues() {
        let e = entry(100, Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(
            decide_stability(100, 100, Instant::now(), &e, STABLE, STUCK),
            StabilityDecision::Enqueue
        );
    }

    #[test]
    fn test_growing_file_waits() {
        // Size changed since the last look: not stable, regardless of age.
        let e = entry(100, Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(
            decide_stability(100, 200, Instant::now(), &e, STABLE, STUCK),
            StabilityDecision::Wait
        );
    }

    #[test]
    fn test_continuously_growing_file_goes_stuck() {
        let e = entry(100, Duration::from_secs(301), Duration::from_secs(1));
        assert_eq!(
            decide_stability(100, 200, Instant::now(), &e, STABLE, STUCK),
            StabilityDecision::Stuck
        );
    }

    #[test]
    fn test_stable_wins_over_stuck() {
        // A file that finally settled is enqueued even if it took longer
        // than the stuck timeout to get there.
        let e = entry(100, Duration::from_secs(400), Duration::from_secs(20));
        assert_eq!(
            decide_stability(100, 100, Instant::now(), &e, STABLE, STUCK),
            StabilityDecision::Enqueue
        );
    }

    #[test]
    fn test_upsert_refreshes_only_on_change() {
        let mut pending = HashMap::new();
        let path = PathBuf::from("/uploads/a.jpg");
        let t0 = Instant::now();
        upsert_pending(&mut pending, path.clone(), 100, t0);

        // Same size later: last_change must stay put so age accumulates.
        let t1 = t0 + Duration::from_secs(5);
        upsert_pending(&mut pending, path.clone(), 100, t1);
        assert_eq!(pending[&path].last_change, t0);

        // Size change resets the clock.
        let t2 = t0 + Duration::from_secs(8);
        upsert_pending(&mut pending, path.clone(), 200, t2);
        assert_eq!(pending[&path].last_change, t2);
        assert_eq!(pending[&path].first_seen, t0);
    }
}
