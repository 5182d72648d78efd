//! Run scheduler
//!
//! [`SyncScheduler`] owns the run state machine
//! (`Idle -> AcquiringLock -> Running -> Idle`) and is the only place a
//! run is started, whether by the recurring schedule or by an operator.
//! Cross-run exclusion comes from the [`LockCoordinator`]; the in-process
//! state value only reports what this scheduler is doing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockCoordinator, LockStatus};
use crate::run_log::{RunLogger, RunReport, RunStatus, RunTrigger, SyncRun};
use crate::schedule::{Recurrence, ScheduleState};

/// Longest sleep of the scheduler loop before it re-reads the schedule
const SCHEDULE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The work performed while the run lock is held
#[async_trait]
pub trait RunJob: Send + Sync {
    /// Execute one run
    ///
    /// Non-fatal problems belong in [`RunReport::errors`]; an `Err` marks
    /// the whole run as failed.
    async fn execute(&self, log: &RunLogger, cancel: &CancellationToken) -> SyncResult<RunReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    AcquiringLock,
    Running {
        run_id: Uuid,
        started_at: DateTime<Utc>,
    },
}

/// Files the scheduler shares with other processes
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub runs_dir: PathBuf,
    pub schedule_path: PathBuf,
    pub last_run_path: PathBuf,
}

impl StatePaths {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            runs_dir: config.runs_dir(),
            schedule_path: config.schedule_path(),
            last_run_path: config.last_run_path(),
        }
    }

    pub fn under(state_dir: &Path) -> Self {
        Self {
            runs_dir: state_dir.join("runs"),
            schedule_path: state_dir.join("schedule.json"),
            last_run_path: state_dir.join("last_run.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub schedule: ScheduleState,
    pub next_fire: Option<DateTime<Utc>>,
    pub lock: LockStatus,
    pub last_run: Option<SyncRun>,
}

pub struct SyncScheduler<J: RunJob> {
    job: J,
    locks: LockCoordinator,
    paths: StatePaths,
    max_reported_errors: usize,
    state: Mutex<SchedulerState>,
}

impl<J: RunJob> SyncScheduler<J> {
    pub fn new(job: J, locks: LockCoordinator, paths: StatePaths) -> Self {
        Self {
            job,
            locks,
            paths,
            max_reported_errors: crate::config::DEFAULT_MAX_REPORTED_ERRORS,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn with_max_reported_errors(mut self, max: usize) -> Self {
        self.max_reported_errors = max;
        self
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn state(&self) -> SchedulerState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, next: SchedulerState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Move from `Idle` to `AcquiringLock`; false if already busy
    fn try_begin(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != SchedulerState::Idle {
            return false;
        }
        *state = SchedulerState::AcquiringLock;
        true
    }

    /// Execute one run under the run lock
    ///
    /// Never returns an error: lock conflicts yield a `skipped` run, every
    /// other problem a `failed` one. The lock is released on every path,
    /// including a panicking job, and a summary is always emitted.
    pub async fn run_once(&self, trigger: RunTrigger, cancel: &CancellationToken) -> SyncRun {
        let mut run = SyncRun::start(trigger);

        if !self.try_begin() {
            warn!(run_id = %run.run_id, state = ?self.state(), "A run is already in progress in this process");
            run.finish(RunStatus::Skipped);
            RunLogger::tracing_only(run.run_id).summary(&run, None);
            return run;
        }

        let operation = match trigger {
            RunTrigger::Manual => "run-once",
            RunTrigger::Scheduled => "scheduled",
        };

        let guard = match self.locks.acquire_async(operation).await {
            Ok(guard) => guard,
            Err(SyncError::LockConflict {
                holder,
                acquired_at,
            }) => {
                warn!(
                    run_id = %run.run_id,
                    holder = %holder,
                    acquired_at = %acquired_at.to_rfc3339(),
                    "Skipping run: another run holds the lock"
                );
                run.finish(RunStatus::Skipped);
                self.set_state(SchedulerState::Idle);
                RunLogger::tracing_only(run.run_id).summary(&run, None);
                return run;
            },
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Failed to acquire run lock; not running");
                run.push_error(format!("lock acquisition failed: {}", e), self.max_reported_errors);
                run.finish(RunStatus::Failed);
                self.set_state(SchedulerState::Idle);
                RunLogger::tracing_only(run.run_id).summary(&run, Some(&self.paths.last_run_path));
                return run;
            },
        };

        self.set_state(SchedulerState::Running {
            run_id: run.run_id,
            started_at: run.started_at,
        });

        let logger = RunLogger::create(&self.paths.runs_dir, &run).unwrap_or_else(|e| {
            warn!(error = %e, dir = %self.paths.runs_dir.display(), "Cannot open run log file; logging to tracing only");
            RunLogger::tracing_only(run.run_id)
        });
        logger.info(
            "run started",
            json!({ "trigger": trigger, "lock_holder": guard.token().holder_id }),
        );

        let outcome = AssertUnwindSafe(self.job.execute(&logger, cancel))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(report)) => {
                run.apply(report, self.max_reported_errors);
                run.finish(RunStatus::Succeeded);
            },
            Ok(Err(e)) => {
                logger.error("run failed", json!({ "error": e.to_string(), "fatal": e.is_fatal() }));
                run.push_error(e.to_string(), self.max_reported_errors);
                run.finish(RunStatus::Failed);
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                logger.error("run panicked", json!({ "panic": message }));
                run.push_error(format!("run panicked: {}", message), self.max_reported_errors);
                run.finish(RunStatus::Failed);
            },
        }

        if let Err(e) = guard.release_async().await {
            logger.warn("failed to release run lock", json!({ "error": e.to_string() }));
        }
        self.set_state(SchedulerState::Idle);

        logger.summary(&run, Some(&self.paths.last_run_path));
        run
    }

    /// Validate and persist a recurring schedule
    ///
    /// Malformed expressions are rejected before the lock or the schedule
    /// file is touched.
    pub fn schedule(&self, expression: &str) -> SyncResult<ScheduleState> {
        let recurrence = Recurrence::parse(expression)?;
        let now = Utc::now();
        let state = ScheduleState {
            expression: Some(recurrence.expression().to_string()),
            enabled: true,
            updated_at: Some(now),
        };
        state.save(&self.paths.schedule_path)?;
        info!(
            expression = recurrence.expression(),
            next_fire = ?recurrence.next_after(now),
            "Schedule enabled"
        );
        Ok(state)
    }

    /// Stop future scheduled runs; an in-flight run is not affected
    pub fn disable(&self) -> SyncResult<ScheduleState> {
        let mut state = ScheduleState::load(&self.paths.schedule_path)?;
        state.enabled = false;
        state.updated_at = Some(Utc::now());
        state.save(&self.paths.schedule_path)?;
        info!(expression = ?state.expression, "Schedule disabled");
        Ok(state)
    }

    pub fn status(&self) -> SyncResult<SchedulerStatus> {
        let schedule = ScheduleState::load(&self.paths.schedule_path)?;
        let next_fire = schedule.active().and_then(|r| r.next_after(Utc::now()));
        Ok(SchedulerStatus {
            state: self.state(),
            next_fire,
            schedule,
            lock: self.locks.status()?,
            last_run: SyncRun::load_last(&self.paths.last_run_path)?,
        })
    }

    /// Foreground scheduler loop; returns when `cancel` fires
    ///
    /// The persisted schedule is re-read before every sleep and again
    /// right before firing, so `schedule` and `disable` from another
    /// process take effect without a restart.
    pub async fn run_scheduled(&self, cancel: &CancellationToken) -> SyncResult<()> {
        info!(schedule = %self.paths.schedule_path.display(), "Scheduler loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let next = match ScheduleState::load(&self.paths.schedule_path) {
                Ok(state) => state
                    .active()
                    .and_then(|r| r.next_after(now).map(|at| (r.expression().to_string(), at))),
                Err(e) => {
                    warn!(error = %e, "Cannot read schedule state");
                    None
                },
            };

            let wait = match &next {
                Some((_, at)) => (*at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(SCHEDULE_POLL_INTERVAL),
                None => SCHEDULE_POLL_INTERVAL,
            };
            debug!(next_fire = ?next.as_ref().map(|(_, at)| at), wait_ms = wait.as_millis() as u64, "Scheduler sleeping");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {},
            }

            let Some((expression, at)) = next else {
                continue;
            };
            if Utc::now() < at {
                continue;
            }

            let still_active = ScheduleState::load(&self.paths.schedule_path)
                .ok()
                .and_then(|s| s.active())
                .map(|r| r.expression() == expression)
                .unwrap_or(false);
            if !still_active {
                info!(expression = %expression, "Schedule changed before firing; not running");
                continue;
            }

            let run = self.run_once(RunTrigger::Scheduled, cancel).await;
            info!(run_id = %run.run_id, status = %run.status, "Scheduled run finished");
        }

        info!("Scheduler loop stopped");
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
