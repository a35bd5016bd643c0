use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use timeline::ChapterId;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    normalize_sources, FailureKind, JobError, JobEvent, JobManifest, JobRunner, JobState,
    JobStore, MemoryJobStore, MergeJob, MergeJobId, MergeKind, MergeRequest,
    OrchestratorConfig, ProgressChannel, Result, RunnerError, RunnerJobId, RunnerState,
    RunnerStatus, Subscription, SubscriptionId, WriteBehindStore,
};

struct JobSlot {
    job: MergeJob,
    last_activity: Instant,
    /// Set once the slot has left the job table; holders must look the job up again.
    retired: bool,
}

impl JobSlot {
    fn new(job: MergeJob) -> Self {
        Self {
            job,
            last_activity: Instant::now(),
            retired: false,
        }
    }

    /// Whether runner reports for `attempt` may still change this job.
    fn accepts(&self, attempt: u32) -> bool {
        self.job.retry_count == attempt && self.job.status.is_active()
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Submission {
    Accepted(RunnerJobId),
    Abandoned,
    Failed(RunnerError),
}

struct Inner {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn JobStore>,
    channel: ProgressChannel,
    config: OrchestratorConfig,
    jobs: RwLock<HashMap<MergeJobId, Arc<Mutex<JobSlot>>>>,
}

/// Owns every merge job's lifecycle. Cheap to clone; clones share state.
///
/// Each job is guarded by its own lock. Runner reports, cancellation and
/// retries all mutate a job under that lock, so the first terminal
/// transition wins and later conflicting ones are dropped.
///
/// Only unfinished jobs stay in memory. Finished ones are served from the
/// [`JobStore`], which is written from a background thread; call
/// [`flush`](Self::flush) before exiting to be sure the last writes landed.
/// Never hold the job table lock while waiting for a job lock.
#[derive(Clone)]
pub struct MergeOrchestrator {
    inner: Arc<Inner>,
}

impl MergeOrchestrator {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn JobStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                store: Arc::new(WriteBehindStore::new(store)),
                channel: ProgressChannel::new(),
                config,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn in_memory(runner: Arc<dyn JobRunner>, config: OrchestratorConfig) -> Self {
        Self::new(runner, Arc::new(MemoryJobStore::new()), config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.inner.channel
    }

    pub async fn submit_merge(&self, request: MergeRequest) -> Result<MergeJob> {
        self.submit(MergeKind::FullMerge, request)
    }

    /// Like [`submit_merge`](Self::submit_merge) but renders only the first
    /// couple of inputs for a bounded duration.
    pub async fn submit_preview(&self, request: MergeRequest) -> Result<MergeJob> {
        self.submit(MergeKind::Preview, request)
    }

    fn submit(&self, kind: MergeKind, mut request: MergeRequest) -> Result<MergeJob> {
        match kind {
            MergeKind::Preview => {
                request.truncate_for_preview();
                request
                    .preview_duration_seconds
                    .get_or_insert(self.inner.config.preview_duration_secs);
            }
            MergeKind::FullMerge => request.preview_duration_seconds = None,
        }
        let settings = request.validate()?;
        let job = MergeJob::new(
            kind,
            request.chapter_id,
            normalize_sources(request.input_sources),
            request.quality_tier,
            request.output_format,
            request.override_parameters,
            settings,
            request.preview_duration_seconds,
        );
        let id = job.id;
        let inputs = job.input_sources.len();

        let mut slot = JobSlot::new(job);
        self.inner.commit(&mut slot);
        let snapshot = slot.job.clone();
        self.inner.jobs.write().insert(id, Arc::new(Mutex::new(slot)));

        info!(job = %id, %kind, inputs, chapter = %snapshot.chapter_id, "merge job submitted");
        self.inner.spawn_attempt(id, 0);
        Ok(snapshot)
    }

    /// Current snapshot. Finished jobs and jobs from earlier sessions come
    /// from the store.
    pub fn poll(&self, id: MergeJobId) -> Result<MergeJob> {
        if let Some(slot) = self.inner.slot(id) {
            return Ok(slot.lock().job.clone());
        }
        self.inner.store.load(id)?.ok_or(JobError::NotFound(id))
    }

    /// Output reference of a completed job.
    pub fn download_result(&self, id: MergeJobId) -> Result<String> {
        let job = self.poll(id)?;
        match (job.status, job.output_url) {
            (JobState::Completed, Some(url)) => Ok(url),
            (status, _) => Err(JobError::NotReady { id, status }),
        }
    }

    /// Re-submits a failed job with its original manifest. Returns `false`
    /// once the job has used all its retries.
    pub async fn retry(&self, id: MergeJobId) -> Result<bool> {
        let requeued = self.inner.with_slot(id, |slot| {
            let status = slot.job.status;
            if status != JobState::Failed {
                return Err(JobError::InvalidTransition {
                    from: status,
                    to: JobState::Queued,
                });
            }
            if slot.job.retry_count >= self.inner.config.retry_limit() {
                info!(job = %id, retries = slot.job.retry_count, "retry limit reached");
                return Ok(None);
            }
            slot.job.requeue()?;
            self.inner.commit(slot);
            Ok(Some(slot.job.retry_count))
        })??;
        let Some(attempt) = requeued else {
            return Ok(false);
        };
        info!(job = %id, attempt, "retrying merge job");
        self.inner.spawn_attempt(id, attempt);
        Ok(true)
    }

    /// Cancels a queued or processing job. A job that already finished keeps
    /// its state; the returned state is whatever the job ends up in.
    pub async fn cancel(&self, id: MergeJobId) -> Result<JobState> {
        let cancelled = self.inner.with_slot(id, |slot| -> Result<std::result::Result<_, JobState>> {
            if slot.job.is_terminal() {
                debug!(job = %id, status = %slot.job.status, "cancel ignored for finished job");
                return Ok(Err(slot.job.status));
            }
            slot.job.transition(JobState::Cancelled)?;
            slot.job.queue_position = None;
            slot.job.current_step_label = "Cancelled".into();
            self.inner.commit(slot);
            Ok(Ok(slot.job.runner_job_id.clone()))
        })??;
        let runner_job = match cancelled {
            Ok(runner_job) => runner_job,
            Err(finished) => return Ok(finished),
        };
        info!(job = %id, "merge job cancelled");
        if let Some(runner_job) = runner_job {
            self.inner.cancel_runner_job(&runner_job).await;
        }
        Ok(JobState::Cancelled)
    }

    /// Every job recorded for a chapter, newest first.
    pub fn list_jobs(&self, chapter_id: ChapterId) -> Result<Vec<MergeJob>> {
        let mut jobs: HashMap<MergeJobId, MergeJob> = self
            .inner
            .store
            .list_for_chapter(chapter_id)?
            .into_iter()
            .map(|j| (j.id, j))
            .collect();
        let resident: Vec<Arc<Mutex<JobSlot>>> = self.inner.jobs.read().values().cloned().collect();
        for slot in resident {
            let slot = slot.lock();
            if slot.job.chapter_id == chapter_id {
                jobs.insert(slot.job.id, slot.job.clone());
            }
        }
        let mut jobs: Vec<MergeJob> = jobs.into_values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Forgets a finished job and drops its subscribers.
    pub fn discard(&self, id: MergeJobId) -> Result<()> {
        self.inner.with_slot(id, |slot| {
            if slot.job.status.is_active() {
                return Err(JobError::StillActive(id));
            }
            self.inner.store.delete(id).map(|_| ())
        })??;
        self.inner.channel.close_job(id);
        debug!(job = %id, "merge job discarded");
        Ok(())
    }

    pub fn subscribe(&self, id: MergeJobId) -> Result<Subscription> {
        self.poll(id)?;
        Ok(self.inner.channel.subscribe(id))
    }

    pub fn subscribe_with<F>(&self, id: MergeJobId, callback: F) -> Result<SubscriptionId>
    where
        F: FnMut(JobEvent) + Send + 'static,
    {
        self.poll(id)?;
        Ok(self.inner.channel.subscribe_with(id, callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.channel.unsubscribe(id)
    }

    /// Picks up jobs a previous process left queued or processing.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for job in self.inner.store.list_active()? {
            let id = job.id;
            let attempt = job.retry_count;
            let runner_job = job.runner_job_id.clone();
            {
                let mut jobs = self.inner.jobs.write();
                if jobs.contains_key(&id) {
                    continue;
                }
                jobs.insert(id, Arc::new(Mutex::new(JobSlot::new(job))));
            }
            restored += 1;
            match runner_job {
                Some(runner_job) => {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.monitor(id, attempt, runner_job).await });
                }
                None => self.inner.spawn_attempt(id, attempt),
            }
        }
        info!(restored, "restored active merge jobs");
        Ok(restored)
    }

    /// Blocks until every job change so far is in the store.
    pub fn flush(&self) -> Result<()> {
        self.inner.store.flush()
    }

    /// Number of jobs held in memory; finished jobs are not.
    pub fn resident_jobs(&self) -> usize {
        self.inner.jobs.read().len()
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait(&self, id: MergeJobId) -> Result<MergeJob> {
        loop {
            let job = self.poll(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            sleep(self.inner.config.poll_interval()).await;
        }
    }
}

impl Inner {
    fn slot(&self, id: MergeJobId) -> Option<Arc<Mutex<JobSlot>>> {
        self.jobs.read().get(&id).cloned()
    }

    fn slot_or_load(&self, id: MergeJobId) -> Result<Arc<Mutex<JobSlot>>> {
        if let Some(slot) = self.slot(id) {
            return Ok(slot);
        }
        let job = self.store.load(id)?.ok_or(JobError::NotFound(id))?;
        let slot = self
            .jobs
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(JobSlot::new(job))))
            .clone();
        Ok(slot)
    }

    /// Runs `f` on the job's resident slot, loading it from the store when
    /// needed. A job that is finished afterwards leaves memory again.
    fn with_slot<T>(&self, id: MergeJobId, f: impl FnOnce(&mut JobSlot) -> T) -> Result<T> {
        loop {
            let slot = self.slot_or_load(id)?;
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let out = f(&mut *guard);
            if guard.job.is_terminal() {
                self.retire(&mut *guard);
            }
            return Ok(out);
        }
    }

    /// Drops a finished job from the table. Callers hold its slot lock; a
    /// slot that is not retired is always the table's entry for its id.
    fn retire(&self, slot: &mut JobSlot) {
        if slot.retired {
            return;
        }
        slot.retired = true;
        self.jobs.write().remove(&slot.job.id);
    }

    /// Persists and publishes the slot's current state. Callers hold the slot lock.
    fn commit(&self, slot: &mut JobSlot) {
        slot.job.revision += 1;
        slot.last_activity = Instant::now();
        debug!(
            job = %slot.job.id,
            revision = slot.job.revision,
            status = %slot.job.status,
            progress = slot.job.progress_percent,
            "job updated"
        );
        if let Err(err) = self.store.save(&slot.job) {
            warn!(job = %slot.job.id, error = %err, "failed to persist merge job");
        }
        self.channel
            .publish(&JobEvent::from_job(&slot.job, slot.job.revision));
        if slot.job.is_terminal() {
            self.retire(slot);
        }
    }

    fn is_current(&self, id: MergeJobId, attempt: u32) -> bool {
        self.slot(id).is_some_and(|slot| slot.lock().accepts(attempt))
    }

    fn spawn_attempt(self: &Arc<Self>, id: MergeJobId, attempt: u32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive_attempt(id, attempt).await });
    }

    async fn drive_attempt(self: Arc<Self>, id: MergeJobId, attempt: u32) {
        let Some(manifest) = self.manifest_for(id, attempt) else {
            return;
        };
        let runner_job = match self.enqueue_with_backoff(id, attempt, &manifest).await {
            Submission::Accepted(runner_job) => runner_job,
            Submission::Abandoned => return,
            Submission::Failed(err) => {
                let kind = if err.is_transient() {
                    FailureKind::RunnerUnavailable
                } else {
                    FailureKind::Rejected
                };
                let message = format!("could not submit to {}: {err}", self.runner.name());
                self.fail(id, attempt, kind, message);
                return;
            }
        };
        if !self.attach_runner_job(id, attempt, &runner_job) {
            debug!(job = %id, runner_job = %runner_job, "job moved on during submission");
            self.cancel_runner_job(&runner_job).await;
            return;
        }
        self.monitor(id, attempt, runner_job).await;
    }

    fn manifest_for(&self, id: MergeJobId, attempt: u32) -> Option<JobManifest> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        if !slot.accepts(attempt) {
            return None;
        }
        let step = format!("Submitting to {}", self.runner.name());
        if slot.job.record_progress(0.0, Some(&step)) {
            self.commit(&mut slot);
        }
        Some(JobManifest::from_job(&slot.job))
    }

    async fn enqueue_with_backoff(
        &self,
        id: MergeJobId,
        attempt: u32,
        manifest: &JobManifest,
    ) -> Submission {
        let policy = &self.config.retry;
        let tries = policy.attempts.max(1);
        let mut try_no = 0;
        loop {
            match self.runner.enqueue(manifest).await {
                Ok(runner_job) => return Submission::Accepted(runner_job),
                Err(err) if err.is_transient() && try_no + 1 < tries => {
                    let wait = policy.compute_delay(try_no);
                    warn!(
                        job = %id,
                        attempt = try_no + 1,
                        wait = ?wait,
                        error = %err,
                        "runner unavailable, retrying submission"
                    );
                    sleep(wait).await;
                    try_no += 1;
                    if !self.is_current(id, attempt) {
                        return Submission::Abandoned;
                    }
                }
                Err(err) => return Submission::Failed(err),
            }
        }
    }

    fn attach_runner_job(&self, id: MergeJobId, attempt: u32, runner_job: &RunnerJobId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut slot = slot.lock();
        if !slot.accepts(attempt) {
            return false;
        }
        slot.job.runner_job_id = Some(runner_job.clone());
        slot.job.current_step_label = "Waiting for runner".into();
        self.commit(&mut slot);
        true
    }

    async fn monitor(self: Arc<Self>, id: MergeJobId, attempt: u32, runner_job: RunnerJobId) {
        let mut status_errors = 0u32;
        loop {
            sleep(self.config.poll_interval()).await;
            if !self.is_current(id, attempt) {
                return;
            }
            match self.runner.status(&runner_job).await {
                Ok(status) => {
                    status_errors = 0;
                    if let Flow::Stop = self.apply_status(id, attempt, status) {
                        return;
                    }
                }
                Err(err)
                    if err.is_transient() && status_errors + 1 < self.config.max_status_errors =>
                {
                    status_errors += 1;
                    warn!(job = %id, errors = status_errors, error = %err, "runner status unavailable");
                }
                Err(err) => {
                    let message = format!("lost track of runner job {runner_job}: {err}");
                    self.fail(id, attempt, FailureKind::Lost, message);
                    return;
                }
            }
            if self.fail_if_stalled(id, attempt) {
                self.cancel_runner_job(&runner_job).await;
                return;
            }
        }
    }

    fn apply_status(&self, id: MergeJobId, attempt: u32, status: RunnerStatus) -> Flow {
        let Some(slot) = self.slot(id) else {
            return Flow::Stop;
        };
        let mut slot = slot.lock();
        if !slot.accepts(attempt) {
            warn!(
                job = %id,
                attempt,
                current_attempt = slot.job.retry_count,
                status = %slot.job.status,
                runner_state = ?status.state,
                "discarding stale runner status"
            );
            return Flow::Stop;
        }

        match status.state {
            RunnerState::Queued { position } => {
                if slot.job.status == JobState::Queued && slot.job.queue_position != position {
                    slot.job.queue_position = position;
                    slot.job.current_step_label = "Waiting in runner queue".into();
                    self.commit(&mut slot);
                }
                Flow::Continue
            }
            RunnerState::Running => {
                self.mark_processing(&mut slot);
                if slot
                    .job
                    .record_progress(status.progress, status.step.as_deref())
                {
                    self.commit(&mut slot);
                }
                Flow::Continue
            }
            RunnerState::Succeeded => {
                self.mark_processing(&mut slot);
                match status.output_ref.filter(|o| !o.is_empty()) {
                    Some(output) => {
                        slot.job.record_progress(100.0, Some("Completed"));
                        if let Err(err) = slot.job.transition(JobState::Completed) {
                            warn!(job = %id, error = %err, "dropping completion");
                            return Flow::Stop;
                        }
                        slot.job.output_url = Some(output);
                        self.commit(&mut slot);
                        info!(job = %id, attempt, "merge job completed");
                    }
                    None => self.fail_locked(
                        &mut slot,
                        FailureKind::Execution,
                        "runner reported success without an output".into(),
                    ),
                }
                Flow::Stop
            }
            RunnerState::Failed => {
                let message = status
                    .error
                    .unwrap_or_else(|| "runner reported a failure".into());
                self.fail_locked(&mut slot, FailureKind::Execution, message);
                Flow::Stop
            }
            RunnerState::Cancelled => {
                self.fail_locked(
                    &mut slot,
                    FailureKind::Execution,
                    "runner cancelled the job".into(),
                );
                Flow::Stop
            }
        }
    }

    fn mark_processing(&self, slot: &mut JobSlot) {
        if slot.job.status != JobState::Queued {
            return;
        }
        if slot.job.transition(JobState::Processing).is_ok() {
            slot.job.queue_position = None;
            slot.job.current_step_label = "Rendering".into();
            self.commit(slot);
        }
    }

    fn fail(&self, id: MergeJobId, attempt: u32, kind: FailureKind, message: String) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        let mut slot = slot.lock();
        if !slot.accepts(attempt) {
            debug!(job = %id, attempt, failure = %kind, "dropping failure for finished attempt");
            return;
        }
        self.fail_locked(&mut slot, kind, message);
    }

    fn fail_locked(&self, slot: &mut JobSlot, kind: FailureKind, message: String) {
        let id = slot.job.id;
        match slot.job.fail(kind, message) {
            Ok(()) => {
                warn!(
                    job = %id,
                    attempt = slot.job.retry_count,
                    failure = %kind,
                    error = slot.job.error_message.as_deref().unwrap_or_default(),
                    "merge job failed"
                );
                self.commit(slot);
            }
            Err(err) => warn!(job = %id, error = %err, "dropping failure"),
        }
    }

    fn fail_if_stalled(&self, id: MergeJobId, attempt: u32) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut slot = slot.lock();
        if !slot.accepts(attempt) {
            return false;
        }
        let idle = slot.last_activity.elapsed();
        if idle < self.config.stall_timeout() {
            return false;
        }
        warn!(job = %id, idle_secs = idle.as_secs(), "merge job stalled");
        let message = format!("no progress for {} seconds", idle.as_secs());
        self.fail_locked(&mut slot, FailureKind::Stalled, message);
        true
    }

    async fn cancel_runner_job(&self, runner_job: &RunnerJobId) {
        if let Err(err) = self.runner.cancel(runner_job).await {
            warn!(runner_job = %runner_job, error = %err, "runner cancel failed");
        }
    }
}
