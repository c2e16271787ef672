//! `Scheduler`: persisted cron triggers plus the background loop that fires
//! them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use scriptstore_core::Identity;
use scriptstore_registry::VersionRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    cron::CronExpression,
    db::init_db,
    error::{Result, SchedulerError},
    types::{job_id, RestoreSummary, ScheduledJob, SchedulerState},
};

/// What a fired trigger does. Implemented by the executor.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the active version of `identity` with no arguments.
    async fn run_job(&self, identity: &Identity) -> std::result::Result<(), String>;
}

/// Validate `expression` without touching any state.
pub fn parse_cron(expression: &str) -> Result<CronExpression> {
    CronExpression::parse(expression).map_err(|reason| SchedulerError::InvalidCronExpression {
        expression: expression.to_string(),
        reason,
    })
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

const JOB_COLUMNS: &str = "project_name, script_name, cron_expression, next_run, last_run,
     fire_count, created_at, updated_at";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let project_name: String = row.get(0)?;
    let script_name: String = row.get(1)?;
    Ok(ScheduledJob {
        job_id: format!("{project_name}_{script_name}"),
        project_name,
        script_name,
        cron_expression: row.get(2)?,
        next_run: row.get(3)?,
        last_run: row.get(4)?,
        fire_count: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// State shared between the service handle and the loop task.
struct Inner {
    conn: Mutex<Connection>,
    registry: Arc<VersionRegistry>,
    runner: Arc<dyn JobRunner>,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

/// Cron scheduler service. Constructed once by the composition root and
/// shared by handle; nothing about it is global.
///
/// Triggers live in the `scheduled_jobs` table, so a restart only needs
/// [`Scheduler::start`] to pick them up again. Due triggers fire one after
/// another on the loop task; a long run delays the next tick.
pub struct Scheduler {
    inner: Arc<Inner>,
    tick: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    pub fn new(
        conn: Connection,
        registry: Arc<VersionRegistry>,
        runner: Arc<dyn JobRunner>,
        tick: Duration,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                registry,
                runner,
            }),
            tick,
            running: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Restore persisted triggers and start the loop. Returns `false` if it
    /// was already running.
    pub fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        if running.is_some() {
            debug!("scheduler already running");
            return Ok(false);
        }

        let summary = self.restore_jobs()?;
        info!(
            restored = summary.restored,
            failed = summary.failed,
            removed = summary.removed,
            "scheduler jobs restored"
        );

        let (tx, rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, self.tick, rx));
        *running = Some(RunningLoop {
            shutdown: tx,
            _handle: handle,
        });
        info!(tick_ms = self.tick.as_millis() as u64, "scheduler started");
        Ok(true)
    }

    /// Stop the loop. A job that is currently running finishes on its own.
    /// Returns `false` if it was not running.
    pub fn stop(&self) -> Result<bool> {
        let mut running = self.running.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        match running.take() {
            Some(active) => {
                let _ = active.shutdown.send(true);
                info!("scheduler stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.running.lock() {
            Ok(guard) if guard.is_some() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    // -----------------------------------------------------------------------
    // Trigger management
    // -----------------------------------------------------------------------

    /// Install or replace the trigger for `identity` and store the
    /// expression on its active record.
    pub fn schedule(&self, identity: &Identity, expression: &str) -> Result<ScheduledJob> {
        let cron = parse_cron(expression)?;
        self.inner
            .registry
            .set_cron(identity, Some(cron.as_str()))?;
        let job = self.inner.install(identity, &cron, false)?;
        info!(
            job_id = %job.job_id,
            cron = %job.cron_expression,
            next_run = ?job.next_run,
            "job scheduled"
        );
        Ok(job)
    }

    /// Remove the trigger and clear the expression on the active record.
    /// Returns whether a trigger existed.
    pub fn unschedule(&self, identity: &Identity) -> Result<bool> {
        self.inner.registry.set_cron(identity, None)?;
        let removed = self.inner.remove(identity)?;
        if removed {
            info!(job_id = %job_id(identity), "job unscheduled");
        }
        Ok(removed)
    }

    /// Rebuild the trigger set from the registry's active scheduled records.
    ///
    /// Stored triggers whose expression is unchanged keep their `next_run`,
    /// so fire times missed while the process was down are due at once.
    /// A record that cannot be restored is logged and skipped.
    pub fn restore_jobs(&self) -> Result<RestoreSummary> {
        let records = self.inner.registry.active_scheduled()?;
        let mut summary = RestoreSummary::default();
        let mut wanted = Vec::with_capacity(records.len());

        for record in records {
            let identity = record.identity();
            let Some(expression) = record.cron_expression.as_deref() else {
                continue;
            };
            let installed = parse_cron(expression)
                .and_then(|cron| self.inner.install(&identity, &cron, true));
            match installed {
                Ok(job) => {
                    debug!(job_id = %job.job_id, next_run = ?job.next_run, "job restored");
                    summary.restored += 1;
                    wanted.push(identity);
                }
                Err(e) => {
                    error!(
                        project = %identity.project_name,
                        script = %identity.script_name,
                        "failed to restore job: {e}"
                    );
                    summary.failed += 1;
                }
            }
        }

        for job in self.list_jobs()? {
            let identity = job.identity();
            if !wanted.contains(&identity) {
                self.inner.remove(&identity)?;
                warn!(job_id = %job.job_id, "removed stale job");
                summary.removed += 1;
            }
        }
        Ok(summary)
    }

    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.inner.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY project_name, script_name"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get_job(&self, identity: &Identity) -> Result<Option<ScheduledJob>> {
        let conn = self.inner.lock()?;
        get_job(&conn, identity)
    }

    pub fn job_count(&self) -> Result<usize> {
        let conn = self.inner.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM scheduled_jobs", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Fire everything due at `now`. Exposed for tests and manual catch-up.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.tick(now).await
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    /// Upsert the trigger row. With `keep_next_run`, an existing row with
    /// the same expression keeps its pending fire time.
    fn install(
        &self,
        identity: &Identity,
        cron: &CronExpression,
        keep_next_run: bool,
    ) -> Result<ScheduledJob> {
        let conn = self.lock()?;
        let now = Utc::now();

        if keep_next_run {
            if let Some(existing) = get_job(&conn, identity)? {
                if existing.cron_expression == cron.as_str() && existing.next_run.is_some() {
                    return Ok(existing);
                }
            }
        }

        let next_run = cron.next_after(now).map(timestamp);
        if next_run.is_none() {
            warn!(job_id = %job_id(identity), cron = %cron, "expression never fires");
        }
        let now = timestamp(now);
        conn.execute(
            "INSERT INTO scheduled_jobs
             (project_name, script_name, cron_expression, next_run, last_run,
              fire_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)
             ON CONFLICT (project_name, script_name) DO UPDATE SET
                cron_expression = excluded.cron_expression,
                next_run        = excluded.next_run,
                updated_at      = excluded.updated_at",
            params![
                identity.project_name,
                identity.script_name,
                cron.as_str(),
                next_run,
                now
            ],
        )?;
        get_job(&conn, identity)?.ok_or_else(|| {
            SchedulerError::Database(rusqlite::Error::QueryReturnedNoRows)
        })
    }

    fn remove(&self, identity: &Identity) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM scheduled_jobs WHERE project_name = ?1 AND script_name = ?2",
            params![identity.project_name, identity.script_name],
        )?;
        Ok(n > 0)
    }

    /// Advance every due trigger past `now`, then run each one in turn.
    ///
    /// Advancing first means several missed fire times collapse into a
    /// single run, and a crash mid-run does not replay the same fire time.
    async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.claim_due(now)?;
        for identity in &due {
            info!(job_id = %job_id(identity), "firing scheduled job");
            match self.runner.run_job(identity).await {
                Ok(()) => info!(job_id = %job_id(identity), "scheduled job succeeded"),
                Err(e) => warn!(job_id = %job_id(identity), "scheduled job failed: {e}"),
            }
        }
        Ok(due.len())
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<Identity>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now_str = timestamp(now);

        let due: Vec<(Identity, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT project_name, script_name, cron_expression FROM scheduled_jobs
                 WHERE next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run, project_name, script_name",
            )?;
            let rows = stmt.query_map([&now_str], |row| {
                Ok((
                    Identity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut fired = Vec::with_capacity(due.len());
        for (identity, expression) in due {
            let next = match CronExpression::parse(&expression) {
                Ok(cron) => cron.next_after(now).map(timestamp),
                Err(reason) => {
                    error!(job_id = %job_id(&identity), "stored expression invalid: {reason}");
                    None
                }
            };
            tx.execute(
                "UPDATE scheduled_jobs
                 SET next_run = ?1, last_run = ?2, fire_count = fire_count + 1, updated_at = ?2
                 WHERE project_name = ?3 AND script_name = ?4",
                params![next, now_str, identity.project_name, identity.script_name],
            )?;
            fired.push(identity);
        }
        tx.commit()?;
        Ok(fired)
    }
}

fn get_job(conn: &Connection, identity: &Identity) -> Result<Option<ScheduledJob>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs
                 WHERE project_name = ?1 AND script_name = ?2"
            ),
            params![identity.project_name, identity.script_name],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Polls the trigger store until `shutdown` broadcasts `true`.
async fn run_loop(inner: Arc<Inner>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = inner.tick(Utc::now()).await {
                    error!("scheduler tick error: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("scheduler loop exiting");
                    break;
                }
            }
        }
    }
}
