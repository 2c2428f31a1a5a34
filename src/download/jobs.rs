//! Job registry and progress broadcast.
//!
//! The registry is the rendezvous point between producers (pipelines) and
//! progress subscribers: either side may name a job first. Each job keeps the
//! last known progress and a set of bounded per-subscriber channels.
//!
//! Delivery is best-effort per subscriber: `try_send` never blocks the
//! producer; a full channel drops that one update, a closed channel removes
//! the subscriber. The terminal `done` event is the exception and is retried
//! in the background for a subscriber whose channel is full.
//!
//! Locking order is always map shard first, then the job mutex. Mutations run
//! with both held, so removal of an abandoned job can't race a producer.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::config;
use crate::core::metrics;
use crate::download::progress::{Phase, ProgressEvent};

/// Progress as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    /// Raw downloader percent while the source is being fetched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_percent: Option<u8>,
    /// Total media duration in seconds, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Serialize)]
struct DonePayload<'a> {
    #[serde(flatten)]
    progress: &'a ProgressPayload,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// One message on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Current state, always first on a new subscription
    Snapshot(ProgressPayload),
    /// Live progress
    Update(ProgressPayload),
    /// Terminal event; nothing follows it
    Done {
        progress: ProgressPayload,
        ok: bool,
        error: Option<String>,
    },
}

impl JobEvent {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            JobEvent::Snapshot(_) => "snapshot",
            JobEvent::Update(_) => "update",
            JobEvent::Done { .. } => "done",
        }
    }

    pub fn progress(&self) -> &ProgressPayload {
        match self {
            JobEvent::Snapshot(p) | JobEvent::Update(p) => p,
            JobEvent::Done { progress, .. } => progress,
        }
    }

    /// JSON body of the event.
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            JobEvent::Snapshot(p) | JobEvent::Update(p) => serde_json::to_value(p),
            JobEvent::Done { progress, ok, error } => serde_json::to_value(DonePayload {
                progress,
                ok: *ok,
                error: error.as_deref(),
            }),
        };
        value.unwrap_or_else(|e| {
            log::error!("Failed to encode progress event: {}", e);
            serde_json::Value::Null
        })
    }
}

type SubscriberId = u64;

/// Per-job state.
#[derive(Debug)]
struct JobState {
    phase: Phase,
    total_duration: Option<f64>,
    last_position: Option<f64>,
    percent: Option<u8>,
    source_percent: Option<u8>,
    fps: Option<f64>,
    speed_multiplier: Option<f64>,
    bitrate: Option<String>,
    started: bool,
    completed: bool,
    failed: bool,
    error: Option<String>,
    generation: u64,
    subscribers: Vec<(SubscriberId, mpsc::Sender<JobEvent>)>,
}

impl JobState {
    fn new() -> Self {
        Self {
            phase: Phase::Queued,
            total_duration: None,
            last_position: None,
            percent: None,
            source_percent: None,
            fps: None,
            speed_multiplier: None,
            bitrate: None,
            started: false,
            completed: false,
            failed: false,
            error: None,
            generation: 0,
            subscribers: Vec::new(),
        }
    }

    fn is_finished(&self) -> bool {
        self.completed || self.failed
    }

    /// Current progress as a payload.
    fn payload(&self) -> ProgressPayload {
        ProgressPayload {
            phase: self.phase,
            position_seconds: self.last_position,
            percent: self.percent,
            fps: self.fps,
            speed_multiplier: self.speed_multiplier,
            bitrate: self.bitrate.clone(),
            source_percent: self.source_percent,
            duration: self.total_duration,
        }
    }

    /// Restarts progress for a reused job id.
    fn reset(&mut self) {
        let subscribers = std::mem::take(&mut self.subscribers);
        let generation = self.generation + 1;
        *self = JobState::new();
        self.subscribers = subscribers;
        self.generation = generation;
    }

    fn recompute_percent(&mut self) {
        let (Some(duration), Some(position)) = (self.total_duration, self.last_position) else {
            return;
        };
        if duration <= 0.0 {
            return;
        }
        let computed = ((position / duration) * 100.0).round().clamp(0.0, 100.0) as u8;
        // never let a computed percent go backwards
        self.percent = Some(self.percent.map_or(computed, |p| p.max(computed)));
    }

    fn apply(&mut self, event: ProgressEvent) {
        self.started = true;
        self.phase = event.phase();
        match event {
            ProgressEvent::Queued => {}
            ProgressEvent::DownloadingSource { percent } => {
                if percent.is_some() {
                    self.source_percent = percent;
                }
                if self.total_duration.is_none() {
                    self.percent = self.source_percent;
                }
            }
            ProgressEvent::Transcoding {
                position_seconds,
                fps,
                speed_multiplier,
                bitrate,
            } => {
                if let Some(position) = position_seconds {
                    self.last_position = Some(self.last_position.map_or(position, |last| last.max(position)));
                }
                if self.total_duration.is_some() {
                    self.recompute_percent();
                } else if self.percent.is_some() && self.last_position.is_some() {
                    // download percent no longer describes anything
                    self.percent = None;
                }
                self.fps = fps.or(self.fps);
                self.speed_multiplier = speed_multiplier.or(self.speed_multiplier);
                self.bitrate = bitrate.or(self.bitrate.take());
            }
        }
    }

    /// Best-effort fan-out; returns how many subscribers were dropped.
    fn broadcast(&mut self, event: &JobEvent) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!("Subscriber {} is behind, skipping one update", id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        before - self.subscribers.len()
    }
}

type JobEntry = Arc<Mutex<JobState>>;

struct RegistryInner {
    jobs: DashMap<String, JobEntry>,
    retention: Duration,
    next_subscriber: AtomicU64,
}

/// Process-wide job map. Cheap to clone.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    /// `retention` is how long a finished job stays visible.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: DashMap::new(),
                retention,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Runs `f` on the job, creating it if unknown.
    ///
    /// The map shard stays locked while `f` runs, so a concurrent removal
    /// cannot detach the job between lookup and mutation. `f` must not block.
    fn with_job<R>(&self, job_id: &str, f: impl FnOnce(&mut JobState) -> R) -> R {
        let entry = self.inner.jobs.entry(job_id.to_string()).or_insert_with(|| {
            metrics::JOBS_TRACKED.inc();
            log::debug!("Job {} created", job_id);
            Arc::new(Mutex::new(JobState::new()))
        });
        let mut job = entry.value().lock();
        f(&mut *job)
    }

    /// Returns the job, creating it in the queued phase if unknown.
    pub fn get_or_create(&self, job_id: &str) -> ProgressPayload {
        self.with_job(job_id, |job| job.payload())
    }

    /// Current progress of a known job.
    pub fn snapshot(&self, job_id: &str) -> Option<ProgressPayload> {
        let entry = self.inner.jobs.get(job_id).map(|e| Arc::clone(e.value()))?;
        let payload = entry.lock().payload();
        Some(payload)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.inner.jobs.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }

    /// Marks the start of a run for `job_id`.
    ///
    /// A job id that already finished is reset. The known duration, if any,
    /// enables percent computation. Subscribers receive a `queued` update.
    pub fn begin(&self, job_id: &str, total_duration: Option<f64>) {
        let dropped = self.with_job(job_id, |job| {
            if job.is_finished() {
                log::debug!("Job {} reused, resetting progress", job_id);
                job.reset();
            }
            job.total_duration = total_duration.filter(|d| d.is_finite() && *d > 0.0);
            job.apply(ProgressEvent::Queued);
            let event = JobEvent::Update(job.payload());
            job.broadcast(&event)
        });
        metrics::PROGRESS_SUBSCRIBERS.sub(dropped as i64);
    }

    /// Records the total duration when it becomes known mid-stream.
    pub fn set_duration(&self, job_id: &str, total_duration: f64) {
        if !total_duration.is_finite() || total_duration <= 0.0 {
            return;
        }
        self.with_job(job_id, |job| {
            job.total_duration = Some(total_duration);
            job.recompute_percent();
        });
    }

    /// Applies one progress event and fans it out. Ignored once the job is finished.
    pub fn update(&self, job_id: &str, event: ProgressEvent) {
        let dropped = self.with_job(job_id, |job| {
            if job.is_finished() {
                return 0;
            }
            job.apply(event);
            let event = JobEvent::Update(job.payload());
            job.broadcast(&event)
        });
        metrics::PROGRESS_SUBSCRIBERS.sub(dropped as i64);
    }

    /// Opens a subscription. The first event is always a snapshot; a finished
    /// job also gets its `done` event right away and the subscription ends.
    pub fn subscribe(&self, job_id: &str) -> JobSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config::progress::SUBSCRIBER_CHANNEL_DEPTH);

        self.with_job(job_id, |job| {
            let payload = job.payload();
            // fresh channel, capacity >= 2: these cannot fail
            let _ = tx.try_send(JobEvent::Snapshot(payload.clone()));
            if job.is_finished() {
                let _ = tx.try_send(JobEvent::Done {
                    progress: payload,
                    ok: !job.failed,
                    error: job.error.clone(),
                });
            } else {
                job.subscribers.push((id, tx));
                metrics::PROGRESS_SUBSCRIBERS.inc();
            }
        });

        log::debug!("Subscriber {} attached to job {}", id, job_id);
        JobSubscription {
            id,
            job_id: job_id.to_string(),
            rx,
            registry: self.clone(),
        }
    }

    /// Detaches a subscriber. A job that never started and has nobody
    /// listening is forgotten.
    pub fn unsubscribe(&self, job_id: &str, subscriber_id: u64) {
        let Some(entry) = self.inner.jobs.get(job_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let abandoned = {
            let mut job = entry.lock();
            let before = job.subscribers.len();
            job.subscribers.retain(|(id, _)| *id != subscriber_id);
            if job.subscribers.len() < before {
                metrics::PROGRESS_SUBSCRIBERS.dec();
            }
            !job.started && job.subscribers.is_empty()
        };

        if abandoned {
            let removed = self
                .inner
                .jobs
                .remove_if(job_id, |_, e| {
                    let job = e.lock();
                    !job.started && job.subscribers.is_empty()
                })
                .is_some();
            if removed {
                metrics::JOBS_TRACKED.dec();
                log::debug!("Job {} dropped: never started, no subscribers", job_id);
            }
        }
    }

    /// Emits the terminal event and schedules removal after the retention window.
    pub fn mark_done(&self, job_id: &str, result: Result<(), String>) {
        let finished = self.with_job(job_id, |job| {
            if job.is_finished() {
                return None;
            }
            job.started = true;
            match &result {
                Ok(()) => job.completed = true,
                Err(reason) => {
                    job.failed = true;
                    job.error = Some(reason.clone());
                }
            }
            let done = JobEvent::Done {
                progress: job.payload(),
                ok: result.is_ok(),
                error: job.error.clone(),
            };
            Some((done, std::mem::take(&mut job.subscribers), job.generation))
        });
        let Some((done, subscribers, generation)) = finished else {
            return;
        };
        metrics::PROGRESS_SUBSCRIBERS.sub(subscribers.len() as i64);

        for (id, tx) in subscribers {
            match tx.try_send(done.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(event)) => {
                    let retention = self.inner.retention;
                    tokio::spawn(async move {
                        if tokio::time::timeout(retention, tx.send(event)).await.is_err() {
                            log::debug!("Subscriber {} never drained its done event", id);
                        }
                    });
                }
            }
        }

        log::info!(
            "Job {} {}",
            job_id,
            match &result {
                Ok(()) => "completed".to_string(),
                Err(reason) => format!("failed: {}", reason),
            }
        );
        self.schedule_removal(job_id.to_string(), generation);
    }

    fn schedule_removal(&self, job_id: String, generation: u64) {
        let registry = self.clone();
        let retention = self.inner.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let removed = registry
                .inner
                .jobs
                .remove_if(&job_id, |_, e| {
                    let job = e.lock();
                    job.generation == generation && job.is_finished()
                })
                .is_some();
            if removed {
                metrics::JOBS_TRACKED.dec();
                log::debug!("Job {} expired", job_id);
            }
        });
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct JobSubscription {
    id: u64,
    job_id: String,
    rx: mpsc::Receiver<JobEvent>,
    registry: JobRegistry,
}

impl JobSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event, or `None` after `done` (or once the job is gone).
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.job_id, self.id);
    }
}
