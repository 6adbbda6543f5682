//! Job Orchestrator (§4.7): evaluates cron-6 schedules into a queue of
//! pending executions, enforces per-drive exclusion, and exposes
//! pause/resume/cancel plus recommend-tape. This module owns *when* and
//! *where* an execution runs; the Backup/Restore Pipelines (§4.5, §4.6)
//! own what happens once it does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use serde_json::json;

use tbarr_catalog::CatalogStore;
use tbarr_types::{BackupJob, JobExecution, JobExecutionStatus, Tape, TapeStatus, Timestamp};

use crate::collaborators::{AuditSink, Clock, NotificationSink};
use crate::tape::{DriveRegistry, DriveReservation, MediaPool};

/// Wraps a parsed 6-field cron expression (seconds minute hour day month
/// day-of-week) and answers it against an injected `Clock` rather than
/// wall-clock time, so schedules are deterministically testable.
pub struct CronSchedule {
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        Ok(Self { inner: cron::Schedule::from_str(expr).map_err(|e| anyhow!("invalid cron expression '{expr}': {e}"))? })
    }

    /// The next fire time strictly after `after`, or `None` if the
    /// expression can never fire again (a malformed year-pinned
    /// expression, for instance -- the `cron` crate's iterator just ends).
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        let start = Utc.timestamp_opt(after, 0).single()?;
        self.inner.after(&start).next().map(|dt| dt.timestamp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPriority {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct QueuedExecution {
    pub job_id: i64,
    pub priority: ExecutionPriority,
    pub resume_execution_id: Option<i64>,
}

/// Per-execution stop signal, shared with the worker thread running the
/// pipeline. `resumable` records whether the request that set `stop` was
/// a pause (resume allowed) or a cancel (terminal) -- `run_backup`/
/// `run_restore` only see a flat "stop now", the distinction is ours to
/// act on once the pipeline call returns.
struct ExecutionControl {
    stop: Arc<AtomicBool>,
    resumable: AtomicBool,
}

/// A started execution's bookkeeping, returned by `begin` so the caller
/// can drive the actual pipeline and then report back through `finish`.
pub struct StartedExecution {
    pub execution_id: i64,
    pub job: BackupJob,
    pub reservation: DriveReservation,
    pub cancel: Arc<AtomicBool>,
}

/// How a started execution ended, reported back to `finish`.
pub enum ExecutionResult {
    Completed,
    /// The pipeline observed `cancel` and stopped early. `true` if a
    /// resumable checkpoint was saved and the stop was a pause, `false`
    /// for a cancel (terminal, any saved cursor is discarded).
    Stopped,
    Failed(String),
}

pub struct JobOrchestrator {
    pub store: Arc<Mutex<CatalogStore>>,
    pub clock: Arc<dyn Clock>,
    pub drives: Arc<DriveRegistry>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationSink>,
    manual_queue: Mutex<VecDeque<QueuedExecution>>,
    scheduled_queue: Mutex<VecDeque<QueuedExecution>>,
    queued_jobs: Mutex<HashSet<i64>>,
    controls: Mutex<HashMap<i64, Arc<ExecutionControl>>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<Mutex<CatalogStore>>,
        clock: Arc<dyn Clock>,
        drives: Arc<DriveRegistry>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            clock,
            drives,
            audit,
            notifier,
            manual_queue: Mutex::new(VecDeque::new()),
            scheduled_queue: Mutex::new(VecDeque::new()),
            queued_jobs: Mutex::new(HashSet::new()),
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Startup recovery sweep (§4.7, §8 "crash mid-write"): call once
    /// before `tick` or `begin_next` ever run. Releases every drive
    /// reservation (a fresh process has no workers to legitimately hold
    /// one) and pauses every `job_execution` left `running` by a process
    /// that died mid-write, making it resumable if it had reached a
    /// checkpoint. Returns the recovered execution ids for logging.
    pub fn recover(&self) -> Result<Vec<i64>> {
        self.drives.clear_all();
        let store = self.store.lock().unwrap();
        let recovered = store.recover_interrupted_executions()?;
        drop(store);
        for execution_id in &recovered {
            self.audit.append(
                "system",
                "job.execution_recovered",
                "job_execution",
                &execution_id.to_string(),
                json!({}),
            )?;
        }
        if !recovered.is_empty() {
            log::warn!("job orchestrator: recovered {} interrupted execution(s) at startup", recovered.len());
        }
        Ok(recovered)
    }

    /// One scheduler tick (§4.7, §5 "small tokio runtime for their
    /// scheduling timer"): fires every enabled job whose next-run time
    /// has passed and that has no execution already running or queued.
    /// Returns the job ids newly enqueued.
    pub fn tick(&self) -> Result<Vec<i64>> {
        let now = self.clock.now();
        let store = self.store.lock().unwrap();
        let mut fired = Vec::new();

        for job in store.list_enabled_jobs()? {
            let Some(expr) = job.schedule.as_deref() else { continue };
            if self.queued_jobs.lock().unwrap().contains(&job.id) {
                continue;
            }
            if self.has_active_execution(&store, job.id)? {
                continue;
            }

            let schedule = CronSchedule::parse(expr)?;
            let next_run = match job.next_run {
                Some(next) => next,
                None => match schedule.next_after(job.last_run.unwrap_or(now - 1)) {
                    Some(next) => next,
                    None => continue,
                },
            };
            if now < next_run {
                continue;
            }

            self.enqueue(job.id, ExecutionPriority::Scheduled, None);
            store.update_job_schedule(job.id, Some(now), schedule.next_after(now))?;
            fired.push(job.id);
        }
        Ok(fired)
    }

    fn has_active_execution(&self, store: &CatalogStore, job_id: i64) -> Result<bool> {
        Ok(store
            .list_executions_for_job(job_id)?
            .iter()
            .any(|e| matches!(e.status, JobExecutionStatus::Running | JobExecutionStatus::Paused)))
    }

    fn enqueue(&self, job_id: i64, priority: ExecutionPriority, resume_execution_id: Option<i64>) {
        let entry = QueuedExecution { job_id, priority, resume_execution_id };
        let mut queue = match priority {
            ExecutionPriority::Manual => self.manual_queue.lock().unwrap(),
            ExecutionPriority::Scheduled => self.scheduled_queue.lock().unwrap(),
        };
        queue.push_back(entry);
        self.queued_jobs.lock().unwrap().insert(job_id);
    }

    /// Operator-requested out-of-schedule run; enqueues ahead of any
    /// scheduled executions already waiting (§4.7), FIFO among other
    /// manual requests.
    pub fn request_manual_run(&self, job_id: i64) -> Result<()> {
        self.audit.append("operator", "job.manual_run_requested", "backup_job", &job_id.to_string(), json!({}))?;
        self.enqueue(job_id, ExecutionPriority::Manual, None);
        Ok(())
    }

    /// Next queued execution, manual requests ahead of scheduled ones
    /// (§4.7), `None` if nothing is waiting. Does not reserve a drive --
    /// callers that can't place it (e.g. no free drive for the job's
    /// pool) should re-enqueue it with `enqueue` rather than drop it.
    fn dequeue_next(&self) -> Option<QueuedExecution> {
        let popped = {
            let mut manual = self.manual_queue.lock().unwrap();
            manual.pop_front()
        };
        let popped = popped.or_else(|| self.scheduled_queue.lock().unwrap().pop_front());
        if let Some(entry) = &popped {
            self.queued_jobs.lock().unwrap().remove(&entry.job_id);
        }
        popped
    }

    /// Reserves `drive_id` for the next queued execution and opens its
    /// `JobExecution` record. Returns `Ok(None)` if the queue is empty;
    /// if the drive is busy the entry is put back at the front of its
    /// queue so it isn't lost.
    pub fn begin_next(&self, drive_id: i64) -> Result<Option<StartedExecution>> {
        let Some(queued) = self.dequeue_next() else { return Ok(None) };
        let now = self.clock.now();

        if self.drives.is_reserved(drive_id) {
            let mut queue = match queued.priority {
                ExecutionPriority::Manual => self.manual_queue.lock().unwrap(),
                ExecutionPriority::Scheduled => self.scheduled_queue.lock().unwrap(),
            };
            queue.push_front(queued.clone());
            self.queued_jobs.lock().unwrap().insert(queued.job_id);
            return Err(anyhow!(tbarr_types::TapeBackArrError::DriveBusy));
        }

        let store = self.store.lock().unwrap();
        let job = store.get_job(queued.job_id)?.ok_or_else(|| anyhow!("no such job {}", queued.job_id))?;
        let execution_id = match queued.resume_execution_id {
            Some(id) => {
                store.finish_execution(id, JobExecutionStatus::Running, now, None)?;
                id
            }
            None => store.begin_execution(job.id, now)?,
        };
        drop(store);

        let reservation = self.drives.reserve(drive_id, execution_id, now)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.controls
            .lock()
            .unwrap()
            .insert(execution_id, Arc::new(ExecutionControl { stop: cancel.clone(), resumable: AtomicBool::new(false) }));

        self.audit.append(
            "system",
            "job.execution_started",
            "job_execution",
            &execution_id.to_string(),
            json!({ "job_id": job.id, "drive_id": drive_id, "resumed": queued.resume_execution_id.is_some() }),
        )?;
        self.notifier.notify("job.execution_started", json!({ "job_id": job.id, "execution_id": execution_id }));

        Ok(Some(StartedExecution { execution_id, job, reservation, cancel }))
    }

    /// Reports how a started execution ended, updating the catalog and
    /// releasing its control handle.
    pub fn finish(&self, execution_id: i64, result: ExecutionResult) -> Result<()> {
        let now = self.clock.now();
        let control = self.controls.lock().unwrap().remove(&execution_id);

        match result {
            ExecutionResult::Completed => {
                let store = self.store.lock().unwrap();
                store.finish_execution(execution_id, JobExecutionStatus::Completed, now, None)?;
                drop(store);
                self.notifier.notify("job.execution_completed", json!({ "execution_id": execution_id }));
            }
            ExecutionResult::Failed(message) => {
                let store = self.store.lock().unwrap();
                store.finish_execution(execution_id, JobExecutionStatus::Failed, now, Some(&message))?;
                drop(store);
                self.audit.append(
                    "system",
                    "job.execution_failed",
                    "job_execution",
                    &execution_id.to_string(),
                    json!({ "error": message }),
                )?;
                self.notifier.notify("job.execution_failed", json!({ "execution_id": execution_id, "error": message }));
            }
            ExecutionResult::Stopped => {
                let resumable = control.as_ref().map(|c| c.resumable.load(Ordering::SeqCst)).unwrap_or(false);
                let status = if resumable { JobExecutionStatus::Paused } else { JobExecutionStatus::Cancelled };
                let store = self.store.lock().unwrap();
                if !resumable {
                    store.save_resume_state(execution_id, None)?;
                }
                store.finish_execution(execution_id, status, now, None)?;
                drop(store);
                self.audit.append(
                    "operator",
                    if resumable { "job.execution_paused" } else { "job.execution_cancelled" },
                    "job_execution",
                    &execution_id.to_string(),
                    json!({}),
                )?;
            }
        }
        Ok(())
    }

    /// Signals a running execution's worker to checkpoint and stop,
    /// leaving it resumable (§4.7). No-op if the execution is not
    /// currently running (it may already have finished).
    pub fn pause(&self, execution_id: i64) -> Result<()> {
        let control = self.controls.lock().unwrap().get(&execution_id).cloned();
        let Some(control) = control else { return Ok(()) };
        control.resumable.store(true, Ordering::SeqCst);
        control.stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancels an execution, running or merely queued. A queued (not yet
    /// started) execution is simply dropped from its queue and marked
    /// terminal directly, since no worker is watching a control flag yet.
    pub fn cancel(&self, execution_id: i64) -> Result<()> {
        if let Some(control) = self.controls.lock().unwrap().get(&execution_id).cloned() {
            control.resumable.store(false, Ordering::SeqCst);
            control.stop.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let mut removed_job_id = None;
        {
            let mut manual = self.manual_queue.lock().unwrap();
            if let Some(entry) = manual.iter().find(|q| q.resume_execution_id == Some(execution_id)) {
                removed_job_id = Some(entry.job_id);
            }
            manual.retain(|q| q.resume_execution_id != Some(execution_id));
        }
        if removed_job_id.is_none() {
            let mut scheduled = self.scheduled_queue.lock().unwrap();
            if let Some(entry) = scheduled.iter().find(|q| q.resume_execution_id == Some(execution_id)) {
                removed_job_id = Some(entry.job_id);
            }
            scheduled.retain(|q| q.resume_execution_id != Some(execution_id));
        }
        let removed = removed_job_id.is_some();
        if let Some(job_id) = removed_job_id {
            self.queued_jobs.lock().unwrap().remove(&job_id);
        }

        let now = self.clock.now();
        let store = self.store.lock().unwrap();
        store.save_resume_state(execution_id, None)?;
        store.finish_execution(execution_id, JobExecutionStatus::Cancelled, now, None)?;
        drop(store);
        self.audit.append("operator", "job.execution_cancelled", "job_execution", &execution_id.to_string(), json!({ "was_queued": removed }))?;
        Ok(())
    }

    /// Enqueues a job's most recent resumable execution ahead of
    /// scheduled work, if one exists (§4.7 "resume restarts from the
    /// checkpoint"). The pipeline itself interprets the saved
    /// `ResumeState` once `begin_next` hands the execution back out.
    pub fn resume(&self, job_id: i64) -> Result<Option<JobExecution>> {
        let store = self.store.lock().unwrap();
        let Some(execution) = store.resumable_execution_for_job(job_id)? else { return Ok(None) };
        drop(store);
        self.enqueue(job_id, ExecutionPriority::Manual, Some(execution.id));
        Ok(Some(execution))
    }

    /// Recommend-tape (§4.7): delegates to `MediaPool::recommend_tape`.
    pub fn recommend_tape(&self, pool_id: i64) -> Result<Option<Tape>> {
        let store = self.store.lock().unwrap();
        MediaPool::new(&store, pool_id).recommend_tape()
    }

    /// Applies an operator- or pipeline-driven tape status transition,
    /// enforced by `TapeStatus::can_transition` (§4.7's state machine).
    /// `manual` permits the `retired` override and arbitrary `exported`
    /// reimport; it is never set for transitions the pipelines themselves
    /// drive (`blank -> active`, `active -> full`, spanning's
    /// `expired -> active` reuse already goes through `MediaPool`).
    pub fn transition_tape(&self, tape_id: i64, next: TapeStatus, manual: bool) -> Result<()> {
        let store = self.store.lock().unwrap();
        store.transition_tape_status(tape_id, next, manual)?;
        drop(store);
        self.audit.append(
            "operator",
            "tape.status_transition",
            "tape",
            &tape_id.to_string(),
            json!({ "next": format!("{next:?}"), "manual": manual }),
        )
    }
}
