use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use project::{MergeJobRow, MergeJobUpsert, ProjectDb};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use timeline::ChapterId;
use tracing::{debug, warn};

use crate::{JobError, JobState, MergeJob, MergeJobId, Result};

/// Durable record of merge jobs, written on every accepted transition.
pub trait JobStore: Send + Sync {
    fn save(&self, job: &MergeJob) -> Result<()>;

    fn load(&self, id: MergeJobId) -> Result<Option<MergeJob>>;

    /// Newest first.
    fn list_for_chapter(&self, chapter_id: ChapterId) -> Result<Vec<MergeJob>>;

    /// Queued and processing jobs, oldest first.
    fn list_active(&self) -> Result<Vec<MergeJob>>;

    fn delete(&self, id: MergeJobId) -> Result<bool>;

    /// Returns once every earlier write has reached durable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<MergeJobId, MergeJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, job: &MergeJob) -> Result<()> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    fn load(&self, id: MergeJobId) -> Result<Option<MergeJob>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    fn list_for_chapter(&self, chapter_id: ChapterId) -> Result<Vec<MergeJob>> {
        let mut jobs: Vec<MergeJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.chapter_id == chapter_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn list_active(&self) -> Result<Vec<MergeJob>> {
        let mut jobs: Vec<MergeJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn delete(&self, id: MergeJobId) -> Result<bool> {
        Ok(self.jobs.lock().remove(&id).is_some())
    }
}

/// Jobs persisted in the `merge_jobs` table of a [`ProjectDb`].
pub struct SqliteJobStore {
    db: Mutex<ProjectDb>,
}

impl SqliteJobStore {
    pub fn new(db: ProjectDb) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = ProjectDb::open_or_create(path).map_err(store_err)?;
        Ok(Self::new(db))
    }
}

fn store_err(err: impl std::fmt::Display) -> JobError {
    JobError::Store(err.to_string())
}

fn job_from_row(row: &MergeJobRow) -> Result<MergeJob> {
    serde_json::from_str(&row.json)
        .map_err(|e| JobError::Store(format!("corrupt merge job {}: {e}", row.id)))
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &MergeJob) -> Result<()> {
        let json = serde_json::to_string(job).map_err(store_err)?;
        let id = job.id.to_string();
        let chapter_id = job.chapter_id.to_string();
        self.db
            .lock()
            .upsert_merge_job(&MergeJobUpsert {
                id: &id,
                chapter_id: &chapter_id,
                kind: job.kind.as_str(),
                status: job.status.as_str(),
                retry_count: i64::from(job.retry_count),
                json: &json,
            })
            .map_err(store_err)
    }

    fn load(&self, id: MergeJobId) -> Result<Option<MergeJob>> {
        let row = self
            .db
            .lock()
            .get_merge_job(&id.to_string())
            .map_err(store_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    fn list_for_chapter(&self, chapter_id: ChapterId) -> Result<Vec<MergeJob>> {
        let rows = self
            .db
            .lock()
            .list_merge_jobs_for_chapter(&chapter_id.to_string())
            .map_err(store_err)?;
        rows.iter().map(job_from_row).collect()
    }

    fn list_active(&self) -> Result<Vec<MergeJob>> {
        let rows = self
            .db
            .lock()
            .list_merge_jobs_by_status(&[JobState::Queued.as_str(), JobState::Processing.as_str()])
            .map_err(store_err)?;
        rows.iter().map(job_from_row).collect()
    }

    fn delete(&self, id: MergeJobId) -> Result<bool> {
        self.db
            .lock()
            .delete_merge_job(&id.to_string())
            .map_err(store_err)
    }
}

/// Latest not-yet-written state of one job; `None` is a pending delete.
struct Pending {
    version: u64,
    job: Option<MergeJob>,
}

#[derive(Default)]
struct PendingWrites {
    next_version: u64,
    by_job: HashMap<MergeJobId, Pending>,
}

enum WriterCommand {
    Write { id: MergeJobId, version: u64 },
    Flush(Sender<()>),
}

/// Puts a [`JobStore`] behind a dedicated writer thread.
///
/// `save` and `delete` only record the change and return; the thread
/// applies them in order. Reads see pending changes, so callers observe
/// their own writes before the backing store does.
pub struct WriteBehindStore {
    backing: Arc<dyn JobStore>,
    pending: Arc<Mutex<PendingWrites>>,
    tx: Sender<WriterCommand>,
}

impl WriteBehindStore {
    pub fn new(backing: Arc<dyn JobStore>) -> Self {
        let pending = Arc::new(Mutex::new(PendingWrites::default()));
        let (tx, rx) = unbounded();
        let writer_backing = backing.clone();
        let writer_pending = pending.clone();
        thread::spawn(move || run_writer(writer_backing, writer_pending, rx));
        Self {
            backing,
            pending,
            tx,
        }
    }

    fn record(&self, id: MergeJobId, job: Option<MergeJob>) -> Result<()> {
        let version = {
            let mut pending = self.pending.lock();
            pending.next_version += 1;
            let version = pending.next_version;
            pending.by_job.insert(id, Pending { version, job });
            version
        };
        self.tx
            .send(WriterCommand::Write { id, version })
            .map_err(|_| JobError::Store("job writer stopped".into()))
    }

    /// Applies pending changes on top of rows read from the backing store.
    fn overlay(&self, mut jobs: Vec<MergeJob>, keep: impl Fn(&MergeJob) -> bool) -> Vec<MergeJob> {
        let pending = self.pending.lock();
        jobs.retain(|j| !pending.by_job.contains_key(&j.id));
        jobs.extend(
            pending
                .by_job
                .values()
                .filter_map(|p| p.job.as_ref())
                .filter(|j| keep(j))
                .cloned(),
        );
        jobs
    }
}

fn run_writer(
    backing: Arc<dyn JobStore>,
    pending: Arc<Mutex<PendingWrites>>,
    rx: Receiver<WriterCommand>,
) {
    for command in rx {
        match command {
            WriterCommand::Write { id, version } => {
                let change = pending
                    .lock()
                    .by_job
                    .get(&id)
                    .filter(|p| p.version == version)
                    .map(|p| p.job.clone());
                // a later write for the same job is already queued
                let Some(change) = change else {
                    continue;
                };
                let result = match &change {
                    Some(job) => backing.save(job),
                    None => backing.delete(id).map(|_| ()),
                };
                if let Err(err) = result {
                    warn!(job = %id, error = %err, "failed to persist merge job");
                }
                let mut pending = pending.lock();
                if pending.by_job.get(&id).is_some_and(|p| p.version == version) {
                    pending.by_job.remove(&id);
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("merge job writer stopped");
}

impl JobStore for WriteBehindStore {
    fn save(&self, job: &MergeJob) -> Result<()> {
        self.record(job.id, Some(job.clone()))
    }

    fn load(&self, id: MergeJobId) -> Result<Option<MergeJob>> {
        if let Some(p) = self.pending.lock().by_job.get(&id) {
            return Ok(p.job.clone());
        }
        self.backing.load(id)
    }

    fn list_for_chapter(&self, chapter_id: ChapterId) -> Result<Vec<MergeJob>> {
        let rows = self.backing.list_for_chapter(chapter_id)?;
        let mut jobs = self.overlay(rows, |j| j.chapter_id == chapter_id);
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn list_active(&self) -> Result<Vec<MergeJob>> {
        let rows = self.backing.list_active()?;
        let mut jobs = self.overlay(rows, |j| j.status.is_active());
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn delete(&self, id: MergeJobId) -> Result<bool> {
        let pending = self.pending.lock().by_job.get(&id).map(|p| p.job.is_some());
        let existed = match pending {
            Some(existed) => existed,
            None => self.backing.load(id)?.is_some(),
        };
        self.record(id, None)?;
        Ok(existed)
    }

    fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| JobError::Store("job writer stopped".into()))?;
        done_rx
            .recv()
            .map_err(|_| JobError::Store("job writer stopped".into()))?;
        self.backing.flush()
    }
}
