use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use scriptstore_core::{
    ExecutionEntry, Identity, LastStatus, ScriptRecord, SourceMetadata, Trigger,
};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{RegistryError, Result},
    version::Version,
};

const RECORD_COLUMNS: &str = "id, project_name, script_name, version, is_active, env_name,
     created_at, last_run, last_status, run_count, cron_expression,
     repository, branch, commit_sha";

/// What a caller asks for when registering a new version.
#[derive(Debug, Clone, Default)]
pub struct RegistrationRequest {
    /// `None` inherits the previous active version's expression.
    pub cron_expression: Option<String>,
    pub source: SourceMetadata,
    /// Sandbox already provisioned for the new version, if any.
    pub env_name: Option<String>,
}

/// Result of [`VersionRegistry::register_or_update`].
#[derive(Debug, Clone)]
pub struct Registration {
    /// The new, now active, record.
    pub record: ScriptRecord,
    /// The record it replaced, already retired.
    pub superseded: Option<ScriptRecord>,
}

/// Result of one script run, as reported by the executor.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Version that actually ran (history only; statistics always go to
    /// whichever record is active when the run completes).
    pub version: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub env_name: Option<String>,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
}

/// Authoritative record of scripts, versions, active flags and run history.
///
/// Thread-safe: every operation takes the connection mutex, so writers for
/// the same identity are serialized, and multi-statement updates run inside
/// one SQLite transaction.
pub struct VersionRegistry {
    db: Mutex<Connection>,
}

impl VersionRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Version the next successful registration for `identity` will get.
    pub fn next_version(&self, identity: &Identity) -> Result<Version> {
        let db = self.lock()?;
        match active_in(&db, identity)? {
            Some(current) => Ok(parse_version(identity, &current.version)?.next_patch()),
            None => Ok(Version::INITIAL),
        }
    }

    /// Create version 1.0.0, or retire the active version and activate its
    /// patch successor, atomically.
    pub fn register_or_update(
        &self,
        identity: &Identity,
        request: &RegistrationRequest,
    ) -> Result<Registration> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;

        let previous = active_in(&tx, identity)?;
        let version = match &previous {
            Some(current) => parse_version(identity, &current.version)?.next_patch(),
            None => Version::INITIAL,
        };
        let cron = request.cron_expression.clone().or_else(|| {
            previous
                .as_ref()
                .and_then(|p| p.cron_expression.clone())
        });

        if let Some(prev) = &previous {
            tx.execute(
                "UPDATE scripts SET is_active = 0 WHERE id = ?1",
                params![prev.id],
            )?;
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO scripts
             (project_name, script_name, version, is_active, env_name, created_at,
              run_count, cron_expression, repository, branch, commit_sha)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, 0, ?6, ?7, ?8, ?9)",
            params![
                identity.project_name,
                identity.script_name,
                version.to_string(),
                request.env_name,
                now,
                cron,
                request.source.repository,
                request.source.branch,
                request.source.commit_sha,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let record = record_by_id(&tx, id)?;
        tx.commit()?;

        let superseded = previous.map(|mut p| {
            p.is_active = false;
            p
        });
        info!(
            project = %identity.project_name,
            script = %identity.script_name,
            version = %record.version,
            replaced = ?superseded.as_ref().map(|p| p.version.as_str()),
            "version registered"
        );
        Ok(Registration { record, superseded })
    }

    /// The active record, or `NotFound`.
    pub fn get_active(&self, identity: &Identity) -> Result<ScriptRecord> {
        self.find_active(identity)?
            .ok_or_else(|| RegistryError::NotFound {
                identity: identity.clone(),
            })
    }

    pub fn find_active(&self, identity: &Identity) -> Result<Option<ScriptRecord>> {
        let db = self.lock()?;
        active_in(&db, identity)
    }

    /// Apply a run's result to whichever record is active right now and
    /// append it to the execution history, in one transaction.
    pub fn record_execution(
        &self,
        identity: &Identity,
        outcome: &ExecutionOutcome,
    ) -> Result<ScriptRecord> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;

        let active = active_in(&tx, identity)?.ok_or_else(|| RegistryError::NotFound {
            identity: identity.clone(),
        })?;
        if active.version != outcome.version {
            warn!(
                project = %identity.project_name,
                script = %identity.script_name,
                ran = %outcome.version,
                active = %active.version,
                "active version changed during execution; recording on the new one"
            );
        }

        let finished = Utc::now().to_rfc3339();
        let status = LastStatus::from_success(outcome.success).to_string();
        tx.execute(
            "UPDATE scripts SET last_run = ?1, last_status = ?2, run_count = run_count + 1,
                    env_name = COALESCE(?3, env_name)
             WHERE id = ?4",
            params![finished, status, outcome.env_name, active.id],
        )?;
        tx.execute(
            "INSERT INTO executions
             (project_name, script_name, version, env_name, trigger, started_at,
              finished_at, success, exit_code, stdout, stderr)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                identity.project_name,
                identity.script_name,
                outcome.version,
                outcome.env_name,
                outcome.trigger.to_string(),
                outcome.started_at.to_rfc3339(),
                finished,
                outcome.success,
                outcome.exit_code,
                outcome.stdout,
                outcome.stderr,
            ],
        )?;
        let updated = record_by_id(&tx, active.id)?;
        tx.commit()?;

        debug!(
            project = %identity.project_name,
            script = %identity.script_name,
            status = %status,
            run_count = updated.run_count,
            "execution recorded"
        );
        Ok(updated)
    }

    /// Every record, active and retired, oldest first.
    pub fn list_all(&self) -> Result<Vec<ScriptRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM scripts
             ORDER BY project_name, script_name, id"
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active records carrying a cron expression; the trigger set to restore.
    pub fn active_scheduled(&self) -> Result<Vec<ScriptRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM scripts
             WHERE is_active = 1 AND cron_expression IS NOT NULL
             ORDER BY project_name, script_name"
        ))?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Set or clear the cron expression on the active record.
    pub fn set_cron(&self, identity: &Identity, cron_expression: Option<&str>) -> Result<()> {
        let db = self.lock()?;
        let n = db.execute(
            "UPDATE scripts SET cron_expression = ?1
             WHERE project_name = ?2 AND script_name = ?3 AND is_active = 1",
            params![cron_expression, identity.project_name, identity.script_name],
        )?;
        if n == 0 {
            return Err(RegistryError::NotFound {
                identity: identity.clone(),
            });
        }
        Ok(())
    }

    /// Store the sandbox key on the active record.
    pub fn set_environment(&self, identity: &Identity, env_name: &str) -> Result<()> {
        let db = self.lock()?;
        let n = db.execute(
            "UPDATE scripts SET env_name = ?1
             WHERE project_name = ?2 AND script_name = ?3 AND is_active = 1",
            params![env_name, identity.project_name, identity.script_name],
        )?;
        if n == 0 {
            return Err(RegistryError::NotFound {
                identity: identity.clone(),
            });
        }
        Ok(())
    }

    /// Point every active record deployed from `repository`@`branch` at a
    /// new commit. `repository` lists all names the repo is known by (clone
    /// URL, web URL, `owner/name`). Returns the number of records updated.
    pub fn update_commit(
        &self,
        repository: &[String],
        branch: &str,
        commit_sha: &str,
    ) -> Result<usize> {
        let db = self.lock()?;
        let mut updated = 0;
        for name in repository {
            updated += db.execute(
                "UPDATE scripts SET commit_sha = ?1
                 WHERE is_active = 1 AND repository = ?2 AND branch = ?3
                   AND (commit_sha IS NULL OR commit_sha != ?1)",
                params![commit_sha, name, branch],
            )?;
        }
        if updated > 0 {
            info!(branch, commit = commit_sha, updated, "commit updated from webhook");
        }
        Ok(updated)
    }

    /// Most recent executions for `identity`, newest first.
    pub fn list_executions(
        &self,
        identity: &Identity,
        limit: usize,
    ) -> Result<Vec<ExecutionEntry>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, project_name, script_name, version, env_name, trigger,
                    started_at, finished_at, success, exit_code, stdout, stderr
             FROM executions
             WHERE project_name = ?1 AND script_name = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![identity.project_name, identity.script_name, limit as i64],
            |row| {
                let trigger: String = row.get(5)?;
                Ok(ExecutionEntry {
                    id: row.get(0)?,
                    project_name: row.get(1)?,
                    script_name: row.get(2)?,
                    version: row.get(3)?,
                    env_name: row.get(4)?,
                    trigger: parse_column(5, &trigger)?,
                    started_at: row.get(6)?,
                    finished_at: row.get(7)?,
                    success: row.get(8)?,
                    exit_code: row.get(9)?,
                    stdout: row.get(10)?,
                    stderr: row.get(11)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| RegistryError::LockPoisoned)
    }
}

fn active_in(conn: &Connection, identity: &Identity) -> Result<Option<ScriptRecord>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM scripts
                 WHERE project_name = ?1 AND script_name = ?2 AND is_active = 1"
            ),
            params![identity.project_name, identity.script_name],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

fn record_by_id(conn: &Connection, id: i64) -> Result<ScriptRecord> {
    Ok(conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM scripts WHERE id = ?1"),
        params![id],
        row_to_record,
    )?)
}

fn parse_version(identity: &Identity, raw: &str) -> Result<Version> {
    raw.parse().map_err(|_| RegistryError::CorruptVersion {
        identity: identity.clone(),
        version: raw.to_string(),
    })
}

/// Decode a text column holding a stored enum; unknown text is a
/// conversion error, not a silent default.
fn parse_column<T>(index: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScriptRecord> {
    let status: Option<String> = row.get(8)?;
    Ok(ScriptRecord {
        id: row.get(0)?,
        project_name: row.get(1)?,
        script_name: row.get(2)?,
        version: row.get(3)?,
        is_active: row.get(4)?,
        env_name: row.get(5)?,
        created_at: row.get(6)?,
        last_run: row.get(7)?,
        last_status: status.map(|s| parse_column(8, &s)).transpose()?,
        run_count: row.get(9)?,
        cron_expression: row.get(10)?,
        source: SourceMetadata {
            repository: row.get(11)?,
            branch: row.get(12)?,
            commit_sha: row.get(13)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VersionRegistry {
        VersionRegistry::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn outcome(version: &str, success: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            version: version.to_string(),
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            env_name: Some("etl-v1-abcd1234-py3.9".to_string()),
            trigger: Trigger::Manual,
            started_at: Utc::now(),
            stdout: "out".to_string(),
            stderr: if success { String::new() } else { "boom".to_string() },
        }
    }

    fn active_count(reg: &VersionRegistry, id: &Identity) -> usize {
        reg.list_all()
            .unwrap()
            .iter()
            .filter(|r| r.identity() == *id && r.is_active)
            .count()
    }

    #[test]
    fn first_registration_is_1_0_0() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        let reg_out = reg
            .register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        assert_eq!(reg_out.record.version, "1.0.0");
        assert!(reg_out.record.is_active);
        assert!(reg_out.superseded.is_none());
        assert_eq!(reg_out.record.run_count, 0);
        assert!(reg_out.record.last_status.is_none());
    }

    #[test]
    fn n_registrations_leave_one_active_at_patch_n_minus_1() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        for n in 1..=5u64 {
            let out = reg
                .register_or_update(&id, &RegistrationRequest::default())
                .unwrap();
            assert_eq!(out.record.version, format!("1.0.{}", n - 1));
            assert_eq!(active_count(&reg, &id), 1);
        }
        assert_eq!(reg.get_active(&id).unwrap().version, "1.0.4");
        assert_eq!(reg.list_all().unwrap().len(), 5);
    }

    #[test]
    fn update_retires_previous_record() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        let second = reg
            .register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        let prev = second.superseded.unwrap();
        assert_eq!(prev.version, "1.0.0");
        assert!(!prev.is_active);

        let all = reg.list_all().unwrap();
        let old = all.iter().find(|r| r.version == "1.0.0").unwrap();
        assert!(!old.is_active);
    }

    #[test]
    fn identities_are_independent() {
        let reg = registry();
        let a = Identity::new("etl", "a");
        let b = Identity::new("etl", "b");
        reg.register_or_update(&a, &RegistrationRequest::default())
            .unwrap();
        reg.register_or_update(&a, &RegistrationRequest::default())
            .unwrap();
        let out = reg
            .register_or_update(&b, &RegistrationRequest::default())
            .unwrap();
        assert_eq!(out.record.version, "1.0.0");
        assert_eq!(reg.next_version(&a).unwrap().to_string(), "1.0.2");
    }

    #[test]
    fn get_active_unknown_identity_is_not_found() {
        let reg = registry();
        let err = reg.get_active(&Identity::new("nope", "nope")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn corrupt_version_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO scripts (project_name, script_name, version, is_active, created_at)
             VALUES ('p', 's', 'banana', 1, '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let reg = VersionRegistry::new(conn).unwrap();
        let err = reg
            .register_or_update(&Identity::new("p", "s"), &RegistrationRequest::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::CorruptVersion { .. }));
    }

    #[test]
    fn unknown_trigger_text_is_a_decoding_error() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        reg.record_execution(&id, &outcome("1.0.0", true)).unwrap();
        reg.lock()
            .unwrap()
            .execute("UPDATE executions SET trigger = 'cron'", [])
            .unwrap();

        let err = reg.list_executions(&id, 10).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Database(rusqlite::Error::FromSqlConversionFailure(5, _, _))
        ));
    }

    #[test]
    fn record_execution_updates_statistics_and_history() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();

        let rec = reg.record_execution(&id, &outcome("1.0.0", true)).unwrap();
        assert_eq!(rec.run_count, 1);
        assert_eq!(rec.last_status, Some(LastStatus::Success));
        assert!(rec.last_run.is_some());
        assert_eq!(rec.env_name.as_deref(), Some("etl-v1-abcd1234-py3.9"));

        let rec = reg.record_execution(&id, &outcome("1.0.0", false)).unwrap();
        assert_eq!(rec.run_count, 2);
        assert_eq!(rec.last_status, Some(LastStatus::Failed));

        let history = reg.list_executions(&id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].success);
        assert_eq!(history[0].stderr, "boom");
        assert!(history[1].success);
    }

    #[test]
    fn record_execution_targets_record_active_at_completion() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();

        // A run of 1.0.0 that finishes after 1.0.1 became active.
        let rec = reg.record_execution(&id, &outcome("1.0.0", true)).unwrap();
        assert_eq!(rec.version, "1.0.1");
        assert_eq!(rec.run_count, 1);
        assert_eq!(reg.list_executions(&id, 1).unwrap()[0].version, "1.0.0");
    }

    #[test]
    fn record_execution_without_active_is_not_found() {
        let reg = registry();
        let err = reg
            .record_execution(&Identity::new("x", "y"), &outcome("1.0.0", true))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn cron_is_inherited_unless_replaced() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        reg.register_or_update(
            &id,
            &RegistrationRequest {
                cron_expression: Some("0 * * * *".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let second = reg
            .register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        assert_eq!(second.record.cron_expression.as_deref(), Some("0 * * * *"));

        let third = reg
            .register_or_update(
                &id,
                &RegistrationRequest {
                    cron_expression: Some("*/5 * * * *".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(third.record.cron_expression.as_deref(), Some("*/5 * * * *"));

        let scheduled = reg.active_scheduled().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].version, "1.0.2");
    }

    #[test]
    fn set_cron_requires_active_record() {
        let reg = registry();
        let id = Identity::new("etl", "v1");
        assert!(reg.set_cron(&id, Some("0 * * * *")).is_err());
        reg.register_or_update(&id, &RegistrationRequest::default())
            .unwrap();
        reg.set_cron(&id, Some("0 * * * *")).unwrap();
        assert_eq!(reg.active_scheduled().unwrap().len(), 1);
        reg.set_cron(&id, None).unwrap();
        assert!(reg.active_scheduled().unwrap().is_empty());
    }

    #[test]
    fn update_commit_matches_repository_and_branch() {
        let reg = registry();
        let source = SourceMetadata {
            repository: Some("https://github.com/org/scripts.git".into()),
            branch: Some("main".into()),
            commit_sha: Some("aaa".into()),
        };
        let id = Identity::new("etl", "v1");
        reg.register_or_update(
            &id,
            &RegistrationRequest {
                source: source.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        reg.register_or_update(
            &Identity::new("etl", "other"),
            &RegistrationRequest {
                source: SourceMetadata {
                    branch: Some("dev".into()),
                    ..source
                },
                ..Default::default()
            },
        )
        .unwrap();

        let names = vec![
            "https://github.com/org/scripts.git".to_string(),
            "org/scripts".to_string(),
        ];
        assert_eq!(reg.update_commit(&names, "main", "bbb").unwrap(), 1);
        assert_eq!(
            reg.get_active(&id).unwrap().source.commit_sha.as_deref(),
            Some("bbb")
        );
        // same commit again is a no-op
        assert_eq!(reg.update_commit(&names, "main", "bbb").unwrap(), 0);
    }
}
