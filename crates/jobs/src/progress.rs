use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{FailureKind, JobState, MergeJob, MergeJobId};

/// Snapshot of a job published after every accepted transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub job_id: MergeJobId,
    /// Strictly increasing per job.
    pub sequence: u64,
    pub attempt: u32,
    pub status: JobState,
    pub progress_percent: f32,
    pub step_label: String,
    pub queue_position: Option<u32>,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,
}

impl JobEvent {
    pub fn from_job(job: &MergeJob, sequence: u64) -> Self {
        Self {
            job_id: job.id,
            sequence,
            attempt: job.retry_count,
            status: job.status,
            progress_percent: job.progress_percent,
            step_label: job.current_step_label.clone(),
            queue_position: job.queue_position,
            output_url: job.output_url.clone(),
            error_message: job.error_message.clone(),
            failure: job.failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of [`ProgressChannel::subscribe`].
pub struct Subscription {
    pub id: SubscriptionId,
    pub job_id: MergeJobId,
    receiver: Receiver<JobEvent>,
}

impl Subscription {
    pub fn receiver(&self) -> &Receiver<JobEvent> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<JobEvent> {
        self.receiver.try_recv().ok()
    }

    /// `None` on timeout or once the channel side is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<JobEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn drain(&self) -> Vec<JobEvent> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    id: SubscriptionId,
    sender: Sender<JobEvent>,
    active: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct ChannelState {
    next_id: u64,
    by_job: HashMap<MergeJobId, Vec<Subscriber>>,
}

/// Fan-out of [`JobEvent`]s to per-job subscribers. Sends never block.
#[derive(Clone, Default)]
pub struct ProgressChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: MergeJobId) -> Subscription {
        let (tx, rx) = unbounded();
        let id = self.register(job_id, tx, None);
        Subscription {
            id,
            job_id,
            receiver: rx,
        }
    }

    /// Runs `callback` on a dedicated thread for each event until
    /// [`unsubscribe`](Self::unsubscribe) or [`close_job`](Self::close_job).
    pub fn subscribe_with<F>(&self, job_id: MergeJobId, mut callback: F) -> SubscriptionId
    where
        F: FnMut(JobEvent) + Send + 'static,
    {
        let (tx, rx) = unbounded::<JobEvent>();
        let active = Arc::new(AtomicBool::new(true));
        let id = self.register(job_id, tx, Some(active.clone()));
        thread::spawn(move || {
            for event in rx.iter() {
                if !active.load(Ordering::Acquire) {
                    break;
                }
                callback(event);
            }
        });
        id
    }

    /// Stops delivery; nothing published afterwards reaches the subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let mut removed = false;
        state.by_job.retain(|_, subs| {
            subs.retain(|s| {
                if s.id == id {
                    if let Some(active) = &s.active {
                        active.store(false, Ordering::Release);
                    }
                    removed = true;
                    false
                } else {
                    true
                }
            });
            !subs.is_empty()
        });
        removed
    }

    pub fn publish(&self, event: &JobEvent) {
        let mut state = self.state.lock();
        let Some(subs) = state.by_job.get_mut(&event.job_id) else {
            return;
        };
        subs.retain(|s| s.sender.send(event.clone()).is_ok());
        if subs.is_empty() {
            state.by_job.remove(&event.job_id);
        }
    }

    /// Drops every subscriber of a job.
    pub fn close_job(&self, job_id: MergeJobId) {
        if let Some(subs) = self.state.lock().by_job.remove(&job_id) {
            for s in subs {
                if let Some(active) = s.active {
                    active.store(false, Ordering::Release);
                }
            }
        }
    }

    pub fn subscriber_count(&self, job_id: MergeJobId) -> usize {
        self.state
            .lock()
            .by_job
            .get(&job_id)
            .map_or(0, Vec::len)
    }

    fn register(
        &self,
        job_id: MergeJobId,
        sender: Sender<JobEvent>,
        active: Option<Arc<AtomicBool>>,
    ) -> SubscriptionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.by_job.entry(job_id).or_default().push(Subscriber {
            id,
            sender,
            active,
        });
        id
    }
}
