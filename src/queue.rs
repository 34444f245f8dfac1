use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Unit of work emitted by the scanner for every stable file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessFileTask {
    pub file_path: String,
    pub detected_at: DateTime<Utc>,
    pub file_size: i64,
}

/// Task wrapper stored on the wire. `attempts` counts deliveries that have
/// already failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub payload: ProcessFileTask,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// How a handler invocation ended. `Retry` goes back through the backoff
/// schedule; `Terminal` skips straight to the dead-letter path.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Retry(String),
    #[error("{0}")]
    Terminal(String),
}

#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, worker_id: &str, task: &TaskEnvelope) -> Result<(), TaskError>;

    /// Runs once per task, after the last delivery attempt has failed (or
    /// immediately for terminal errors). Quarantine lives behind this.
    async fn on_final_failure(&self, worker_id: &str, task: &TaskEnvelope, error: &TaskError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Another enqueue with the same dedup key is already in flight.
    Coalesced,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub active: u64,
    pub scheduled: u64,
    pub retry: u64,
    pub archived: u64,
}

impl QueueStats {
    pub fn in_flight(&self) -> u64 {
        self.pending + self.active + self.scheduled + self.retry
    }
}

const ARCHIVE_CAP: isize = 1000;
const POP_TIMEOUT_SECS: f64 = 5.0;
const PROMOTE_BATCH: usize = 100;

/// Client half of the queue: enqueue and inspect.
#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
    name: String,
    dedup_window: Duration,
}

impl TaskQueue {
    pub async fn connect(
        redis_url: &str,
        name: &str,
        dedup_window: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to task queue backend at {}", redis_url);

        Ok(Self {
            conn,
            name: name.to_string(),
            dedup_window,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.name, suffix)
    }

    /// Enqueues one task. Repeated enqueues for the same file path coalesce
    /// while the first is still anywhere in the pipeline; the dedup marker
    /// expires with the window as a safety valve against leaks.
    pub async fn enqueue(&self, task: &ProcessFileTask) -> Result<EnqueueOutcome, QueueError> {
        let id = dedup_key(&task.file_path);
        let mut conn = self.conn.clone();

        let marker: bool = redis::cmd("SET")
            .arg(self.key(&format!("dedup:{}", id)))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.dedup_window.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;

        if !marker {
            debug!("Coalesced duplicate enqueue for {}", task.file_path);
            return Ok(EnqueueOutcome::Coalesced);
        }

        let envelope = TaskEnvelope {
            id,
            payload: task.clone(),
            attempts: 0,
            enqueued_at: Utc::now(),
        };

        let raw = serde_json::to_string(&envelope)?;
        let _: () = conn.lpush(self.key("pending"), raw).await?;

        Ok(EnqueueOutcome::Enqueued)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let pending: u64 = conn.llen(self.key("pending")).await?;
        let active: u64 = conn.llen(self.key("active")).await?;
        let scheduled: u64 = conn.zcard(self.key("scheduled")).await?;
        let retry: u64 = conn.zcard(self.key("retry")).await?;
        let archived: u64 = conn.llen(self.key("archived")).await?;

        Ok(QueueStats {
            pending,
            active,
            scheduled,
            retry,
            archived,
        })
    }
}

/// Server half: a fixed pool of workers draining the pending list, plus a
/// promoter that feeds due retry/scheduled entries back in.
pub struct QueueServer {
    conn: ConnectionManager,
    name: String,
    max_retries: u32,
}

impl QueueServer {
    pub async fn connect(redis_url: &str, name: &str, max_retries: u32) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            name: name.to_string(),
            max_retries,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.name, suffix)
    }

    /// Re-queues tasks a crashed process left on the active list. Must run
    /// before the first worker starts; delivery is at-least-once, so the
    /// handlers tolerate the replay.
    pub async fn recover_stale_active(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0u64;

        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(self.key("active"))
                .arg(self.key("pending"))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;

            match moved {
                Some(_) => recovered += 1,
                None => break,
            }
        }

        if recovered > 0 {
            warn!(
                "Recovered {} task(s) abandoned by a previous process",
                recovered
            );
        }

        Ok(recovered)
    }

    /// Spawns the worker pool and the retry promoter. Workers observe the
    /// shutdown signal between tasks; an in-flight handler always runs to
    /// completion (the caller bounds the drain with a grace timeout).
    pub fn start<H: TaskHandler>(
        &self,
        handler: Arc<H>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(workers + 1);

        for n in 0..workers {
            let worker = Worker {
                conn: self.conn.clone(),
                name: self.name.clone(),
                max_retries: self.max_retries,
                worker_id: format!("worker-{}", n),
            };
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run(handler, shutdown).await;
            }));
        }

        let promoter = Promoter {
            conn: self.conn.clone(),
            name: self.name.clone(),
        };
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            promoter.run(shutdown).await;
        }));

        handles
    }
}

struct Worker {
    conn: ConnectionManager,
    name: String,
    max_retries: u32,
    worker_id: String,
}

impl Worker {
    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.name, suffix)
    }

    async fn run<H: TaskHandler>(&self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) {
        info!("{}: draining queue '{}'", self.worker_id, self.name);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut conn = self.conn.clone();
            let popped: Result<Option<String>, redis::RedisError> = tokio::select! {
                res = async {
                    redis::cmd("BLMOVE")
                        .arg(self.key("pending"))
                        .arg(self.key("active"))
                        .arg("RIGHT")
                        .arg("LEFT")
                        .arg(POP_TIMEOUT_SECS)
                        .query_async(&mut conn)
                        .await
                } => res,
                _ = shutdown.changed() => break,
            };

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!("{}: queue pop failed: {}", self.worker_id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let envelope: TaskEnvelope = match serde_json::from_str(&raw) {
                Ok(env) => env,
                Err(e) => {
                    error!("{}: discarding undecodable task: {}", self.worker_id, e);
                    let _ = self.archive_raw(&raw).await;
                    continue;
                }
            };

            match handler.handle(&self.worker_id, &envelope).await {
                Ok(()) => {
                    if let Err(e) = self.ack(&raw, &envelope).await {
                        error!("{}: ack failed: {}", self.worker_id, e);
                    }
                }
                Err(TaskError::Retry(msg)) if envelope.attempts + 1 < self.max_retries => {
                    warn!(
                        "{}: task {} attempt {} failed, will retry: {}",
                        self.worker_id,
                        envelope.payload.file_path,
                        envelope.attempts + 1,
                        msg
                    );
                    if let Err(e) = self.reschedule(&raw, envelope).await {
                        error!("{}: reschedule failed: {}", self.worker_id, e);
                    }
                }
                Err(err) => {
                    warn!(
                        "{}: task {} failed terminally: {}",
                        self.worker_id, envelope.payload.file_path, err
                    );
                    handler
                        .on_final_failure(&self.worker_id, &envelope, &err)
                        .await;
                    if let Err(e) = self.archive(&raw, &envelope).await {
                        error!("{}: archive failed: {}", self.worker_id, e);
                    }
                }
            }
        }

        debug!("{}: stopped", self.worker_id);
    }

    async fn ack(&self, raw: &str, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(self.key("active"), 1, raw).await?;
        let _: () = conn.del(self.key(&format!("dedup:{}", envelope.id))).await?;
        Ok(())
    }

    async fn reschedule(&self, raw: &str, mut envelope: TaskEnvelope) -> Result<(), QueueError> {
        envelope.attempts += 1;
        let due = Utc::now() + retry_backoff(envelope.attempts);
        let next = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let _: () = conn.lrem(self.key("active"), 1, raw).await?;
        let _: () = conn
            .zadd(self.key("retry"), next, due.timestamp_millis())
            .await?;
        Ok(())
    }

    async fn archive(&self, raw: &str, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(self.key("active"), 1, raw).await?;
        let _: () = conn.lpush(self.key("archived"), raw).await?;
        let _: () = conn.ltrim(self.key("archived"), 0, ARCHIVE_CAP - 1).await?;
        let _: () = conn.del(self.key(&format!("dedup:{}", envelope.id))).await?;
        Ok(())
    }

    async fn archive_raw(&self, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lrem(self.key("active"), 1, raw).await?;
        let _: () = conn.lpush(self.key("archived"), raw).await?;
        let _: () = conn.ltrim(self.key("archived"), 0, ARCHIVE_CAP - 1).await?;
        Ok(())
    }
}

/// Moves due entries from the retry and scheduled zsets onto the pending
/// list. The move is a Lua script so a promoter crash can never duplicate
/// or drop an entry.
struct Promoter {
    conn: ConnectionManager,
    name: String,
}

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, item in ipairs(due) do
    redis.call('ZREM', KEYS[1], item)
    redis.call('LPUSH', KEYS[2], item)
end
return #due
"#;

impl Promoter {
    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.name, suffix)
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let script = redis::Script::new(PROMOTE_SCRIPT);
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now().timestamp_millis();
            for zset in ["retry", "scheduled"] {
                let mut conn = self.conn.clone();
                let res: Result<i64, redis::RedisError> = script
                    .key(self.key(zset))
                    .key(self.key("pending"))
                    .arg(now)
                    .arg(PROMOTE_BATCH)
                    .invoke_async(&mut conn)
                    .await;

                match res {
                    Ok(n) if n > 0 => debug!("Promoted {} task(s) from {}", n, zset),
                    Ok(_) => {}
                    Err(e) => error!("Retry promotion failed: {}", e),
                }
            }
        }
    }
}

/// Stable identity for dedup: derived from the file path, the part of the
/// payload that repeats across detections of the same file.
pub fn dedup_key(file_path: &str) -> String {
    let digest = Sha256::digest(file_path.as_bytes());
    hex::encode(&digest[..8])
}

/// Exponential backoff with jitter, capped at ten minutes.
fn retry_backoff(attempts: u32) -> chrono::Duration {
    let base = 2u64.saturating_pow(attempts.min(16));
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    let secs = ((base as f64) * jitter).min(600.0);
    chrono::Duration::milliseconds((secs * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_is_stable() {
        let a = dedup_key("/uploads/a/b/photo.jpg");
        let b = dedup_key("/uploads/a/b/photo.jpg");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_dedup_key_differs_per_path() {
        assert_ne!(dedup_key("/uploads/a.jpg"), dedup_key("/uploads/b.jpg"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for attempt in 1..20 {
            let d = retry_backoff(attempt);
            assert!(d >= chrono::Duration::seconds(1));
            assert!(d <= chrono::Duration::seconds(600));
        }
        // Deep attempt counts saturate at the cap rather than overflowing.
        assert_eq!(retry_backoff(60), retry_backoff(60).min(chrono::Duration::seconds(600)));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = TaskEnvelope {
            id: dedup_key("/uploads/x.jpg"),
            payload: ProcessFileTask {
                file_path: "/uploads/x.jpg".to_string(),
                detected_at: Utc::now(),
                file_size: 1234,
            },
            attempts: 2,
            enqueued_at: Utc::now(),
        };

        let raw = serde_json::to_string(&envelope).unwrap();
        let back: TaskEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, envelope.id);
        assert_eq!(back.payload.file_path, "/uploads/x.jpg");
        assert_eq!(back.attempts, 2);
    }
}
