use rusqlite::Connection;

use crate::error::Result;

/// Initialise the trigger store schema in `conn`.
///
/// One row per `(project, script)` identity; the primary key makes a second
/// trigger for the same identity impossible. `next_run` is indexed for the
/// per-tick due query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            project_name    TEXT    NOT NULL,
            script_name     TEXT    NOT NULL,
            cron_expression TEXT    NOT NULL,
            next_run        TEXT,               -- RFC3339 UTC, NULL if it never fires
            last_run        TEXT,
            fire_count      INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL,
            PRIMARY KEY (project_name, script_name)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run
            ON scheduled_jobs (next_run);
        ",
    )?;
    Ok(())
}
