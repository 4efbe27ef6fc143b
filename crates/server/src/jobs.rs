use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobSettings;

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

const SCAN_LOCK: &str = "library-scan";

/// Work items accepted by the queue. Stored as JSON, e.g.
/// `{"kind":"enrich","media_id":"..","replace":false}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Scan,
    Transcode {
        media_id: String,
    },
    Enrich {
        media_id: String,
        #[serde(default)]
        replace: bool,
    },
}

impl Job {
    /// Jobs sharing a lock key never run at the same time.
    pub fn lock_key(&self) -> String {
        match self {
            Job::Scan => SCAN_LOCK.to_string(),
            Job::Transcode { media_id } | Job::Enrich { media_id, .. } => media_id.clone(),
        }
    }

    fn validate(&self) -> Result<(), JobError> {
        match self {
            Job::Scan => Ok(()),
            Job::Transcode { media_id } | Job::Enrich { media_id, .. } => {
                if media_id.trim().is_empty() {
                    Err(JobError::Invalid("media_id is empty".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub job: Job,
    pub attempts: u32,
    pub enqueued_at: u64,
}

#[derive(Debug)]
pub enum JobError {
    Store(String),
    Invalid(String),
    Failed(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Store(message) => write!(f, "job store error: {}", message),
            JobError::Invalid(message) => write!(f, "invalid job: {}", message),
            JobError::Failed(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for JobError {}

fn store_err(err: impl std::fmt::Display) -> JobError {
    JobError::Store(err.to_string())
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once a job has failed `max_attempts` times and is dropped.
    async fn on_exhausted(&self, _job: &Job) {}
}

#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub conflict_delay: Duration,
}

impl From<&JobSettings> for JobQueueConfig {
    fn from(settings: &JobSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            max_attempts: settings.max_attempts.max(1),
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
            conflict_delay: Duration::from_secs(1),
        }
    }
}

/// Durable FIFO of [`Job`]s backed by a redb table. Delivery is at least once:
/// anything still in the table at startup is handed to the workers again.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<Database>,
    sender: UnboundedSender<String>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<String>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn open(db: Arc<Database>, config: JobQueueConfig) -> Result<Self, JobError> {
        let write_txn = db.begin_write().map_err(store_err)?;
        let _ = write_txn.open_table(JOBS_TABLE).map_err(store_err)?;
        write_txn.commit().map_err(store_err)?;

        let (sender, receiver) = unbounded_channel();
        let queue = Self {
            db,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
        };
        let pending = queue.list_pending()?;
        if !pending.is_empty() {
            info!("Recovered {} pending jobs", pending.len());
        }
        for queued in pending {
            let _ = queue.sender.send(queued.id);
        }
        Ok(queue)
    }

    pub fn enqueue(&self, job: Job) -> Result<QueuedJob, JobError> {
        job.validate()?;
        let enqueued_at = now_millis();
        let queued = QueuedJob {
            id: format!("{:013}-{}", enqueued_at, Uuid::new_v4()),
            job,
            attempts: 0,
            enqueued_at,
        };
        self.store(&queued)?;
        debug!("Enqueued job {} ({:?})", queued.id, queued.job);
        self.sender
            .send(queued.id.clone())
            .map_err(|_| JobError::Store("job channel closed".to_string()))?;
        Ok(queued)
    }

    /// Pending jobs in delivery order. Entries that no longer decode are
    /// removed.
    pub fn list_pending(&self) -> Result<Vec<QueuedJob>, JobError> {
        let mut items = Vec::new();
        let mut broken = Vec::new();
        {
            let read_txn = self.db.begin_read().map_err(store_err)?;
            let table = match read_txn.open_table(JOBS_TABLE) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(err) => return Err(store_err(err)),
            };
            for entry in table.iter().map_err(store_err)? {
                let (key, value) = entry.map_err(store_err)?;
                match decode_job(value.value()) {
                    Ok(queued) => items.push(queued),
                    Err(err) => {
                        warn!("Dropping undecodable job {}: {}", key.value(), err);
                        broken.push(key.value().to_string());
                    }
                }
            }
        }
        for id in broken {
            self.remove(&id)?;
        }
        Ok(items)
    }

    pub fn start(&self, handler: Arc<dyn JobHandler>) {
        let workers = self.config.workers.max(1);
        for worker in 0..workers {
            let queue = self.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                queue.worker_loop(worker, handler).await;
            });
        }
        info!("Started {} job workers", workers);
    }

    async fn worker_loop(self, worker: usize, handler: Arc<dyn JobHandler>) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let id = match next {
                Some(id) => id,
                None => break,
            };
            let queued = match self.load(&id) {
                Ok(Some(queued)) => queued,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Worker {} could not load job {}: {}", worker, id, err);
                    continue;
                }
            };

            let lock_key = queued.job.lock_key();
            if !self.in_flight.lock().insert(lock_key.clone()) {
                debug!("Job {} waits for running work on {}", id, lock_key);
                self.redeliver_after(id, self.config.conflict_delay);
                continue;
            }
            debug!("Worker {} running job {} ({:?})", worker, id, queued.job);
            let result = handler.handle(&queued.job).await;
            self.in_flight.lock().remove(&lock_key);

            match result {
                Ok(()) => {
                    if let Err(err) = self.remove(&id) {
                        warn!("Failed to clear finished job {}: {}", id, err);
                    }
                }
                Err(err) => self.handle_failure(queued, err, handler.as_ref()).await,
            }
        }
    }

    async fn handle_failure(&self, mut queued: QueuedJob, err: JobError, handler: &dyn JobHandler) {
        let attempts = queued.attempts + 1;
        if attempts >= self.config.max_attempts {
            error!(
                "Job {} ({:?}) failed after {} attempts: {}",
                queued.id, queued.job, attempts, err
            );
            if let Err(err) = self.remove(&queued.id) {
                warn!("Failed to clear exhausted job {}: {}", queued.id, err);
            }
            handler.on_exhausted(&queued.job).await;
            return;
        }
        let delay = self.config.retry_delay * attempts;
        warn!(
            "Job {} failed (attempt {}/{}), retrying in {:?}: {}",
            queued.id, attempts, self.config.max_attempts, delay, err
        );
        queued.attempts = attempts;
        if let Err(err) = self.store(&queued) {
            warn!("Failed to persist retry for job {}: {}", queued.id, err);
        }
        self.redeliver_after(queued.id, delay);
    }

    fn redeliver_after(&self, id: String, delay: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(id);
        });
    }

    fn load(&self, id: &str) -> Result<Option<QueuedJob>, JobError> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        let table = match read_txn.open_table(JOBS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(store_err(err)),
        };
        let bytes = match table.get(id).map_err(store_err)? {
            Some(value) => value.value().to_vec(),
            None => return Ok(None),
        };
        drop(table);
        drop(read_txn);
        match decode_job(&bytes) {
            Ok(queued) => Ok(Some(queued)),
            Err(err) => {
                warn!("Dropping undecodable job {}: {}", id, err);
                self.remove(id)?;
                Ok(None)
            }
        }
    }

    fn store(&self, queued: &QueuedJob) -> Result<(), JobError> {
        let bytes = serde_json::to_vec(queued).map_err(store_err)?;
        let write_txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = write_txn.open_table(JOBS_TABLE).map_err(store_err)?;
            table
                .insert(queued.id.as_str(), bytes.as_slice())
                .map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), JobError> {
        let write_txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = write_txn.open_table(JOBS_TABLE).map_err(store_err)?;
            table.remove(id).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;
        Ok(())
    }
}

fn decode_job(bytes: &[u8]) -> Result<QueuedJob, JobError> {
    let queued: QueuedJob =
        serde_json::from_slice(bytes).map_err(|err| JobError::Invalid(err.to_string()))?;
    queued.job.validate()?;
    Ok(queued)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn open_db(dir: &tempfile::TempDir) -> Arc<Database> {
        Arc::new(Database::create(dir.path().join("jobs.redb")).unwrap())
    }

    fn fast_config(workers: usize, max_attempts: u32) -> JobQueueConfig {
        JobQueueConfig {
            workers,
            max_attempts,
            retry_delay: Duration::from_millis(10),
            conflict_delay: Duration::from_millis(10),
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[derive(Default)]
    struct Recorder {
        fail_first: u32,
        calls: AtomicU32,
        done: Mutex<Vec<Job>>,
        exhausted: Mutex<Vec<Job>>,
        running: Mutex<HashMap<String, u32>>,
        max_overlap: AtomicU32,
        hold: Duration,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut running = self.running.lock();
                let count = running.entry(job.lock_key()).or_insert(0);
                *count += 1;
                self.max_overlap.fetch_max(*count, Ordering::SeqCst);
            }
            tokio::time::sleep(self.hold).await;
            if let Some(count) = self.running.lock().get_mut(&job.lock_key()) {
                *count -= 1;
            }
            if call <= self.fail_first {
                return Err(JobError::Failed(format!("boom {}", call)));
            }
            self.done.lock().push(job.clone());
            Ok(())
        }

        async fn on_exhausted(&self, job: &Job) {
            self.exhausted.lock().push(job.clone());
        }
    }

    #[test]
    fn payloads_are_tagged_json() {
        let job = Job::Enrich {
            media_id: "m1".to_string(),
            replace: true,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"kind": "enrich", "media_id": "m1", "replace": true})
        );
        let scan: Job = serde_json::from_str(r#"{"kind":"scan"}"#).unwrap();
        assert_eq!(scan, Job::Scan);
        let enrich: Job = serde_json::from_str(r#"{"kind":"enrich","media_id":"x"}"#).unwrap();
        assert_eq!(
            enrich,
            Job::Enrich {
                media_id: "x".to_string(),
                replace: false
            }
        );
        assert!(serde_json::from_str::<Job>(r#"{"kind":"delete_everything"}"#).is_err());
    }

    #[tokio::test]
    async fn empty_media_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(open_db(&dir), fast_config(1, 3)).unwrap();
        let result = queue.enqueue(Job::Transcode {
            media_id: " ".to_string(),
        });
        assert!(matches!(result, Err(JobError::Invalid(_))));
        assert!(queue.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_job_is_retried_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(open_db(&dir), fast_config(1, 3)).unwrap();
        let handler = Arc::new(Recorder {
            fail_first: 2,
            ..Default::default()
        });
        queue.start(handler.clone());
        queue
            .enqueue(Job::Transcode {
                media_id: "m1".to_string(),
            })
            .unwrap();

        wait_until(|| handler.done.lock().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handler.exhausted.lock().is_empty());
        wait_until(|| queue.list_pending().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn exhausted_job_is_dropped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(open_db(&dir), fast_config(1, 2)).unwrap();
        let handler = Arc::new(Recorder {
            fail_first: u32::MAX,
            ..Default::default()
        });
        queue.start(handler.clone());
        queue
            .enqueue(Job::Transcode {
                media_id: "m1".to_string(),
            })
            .unwrap();

        wait_until(|| handler.exhausted.lock().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(queue.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_media_never_runs_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(open_db(&dir), fast_config(3, 3)).unwrap();
        let handler = Arc::new(Recorder {
            hold: Duration::from_millis(40),
            ..Default::default()
        });
        queue.start(handler.clone());
        for job in [
            Job::Transcode {
                media_id: "m1".to_string(),
            },
            Job::Enrich {
                media_id: "m1".to_string(),
                replace: false,
            },
            Job::Transcode {
                media_id: "m2".to_string(),
            },
        ] {
            queue.enqueue(job).unwrap();
        }

        wait_until(|| handler.done.lock().len() == 3).await;
        assert_eq!(handler.max_overlap.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_jobs_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        {
            let queue = JobQueue::open(Arc::clone(&db), fast_config(1, 3)).unwrap();
            queue.enqueue(Job::Scan).unwrap();
            assert_eq!(queue.list_pending().unwrap().len(), 1);
        }

        let queue = JobQueue::open(db, fast_config(1, 3)).unwrap();
        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job, Job::Scan);

        let handler = Arc::new(Recorder::default());
        queue.start(handler.clone());
        wait_until(|| handler.done.lock().len() == 1).await;
        wait_until(|| queue.list_pending().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        {
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(JOBS_TABLE).unwrap();
                table.insert("0000000000001-bad", b"{not json".as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }
        let queue = JobQueue::open(Arc::clone(&db), fast_config(1, 3)).unwrap();
        assert!(queue.list_pending().unwrap().is_empty());

        let read_txn = db.begin_read().unwrap();
        let table = read_txn.open_table(JOBS_TABLE).unwrap();
        assert!(table.get("0000000000001-bad").unwrap().is_none());
    }
}
