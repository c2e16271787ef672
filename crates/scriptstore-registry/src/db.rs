use rusqlite::{Connection, Result};

/// Initialise the registry schema in `conn`. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_scripts_table(conn)?;
    create_executions_table(conn)?;
    Ok(())
}

/// One row per script version. The partial unique index makes "at most one
/// active version per (project, script)" a storage-level guarantee.
fn create_scripts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scripts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            project_name    TEXT    NOT NULL,
            script_name     TEXT    NOT NULL,
            version         TEXT    NOT NULL,
            is_active       INTEGER NOT NULL DEFAULT 1,
            env_name        TEXT,
            created_at      TEXT    NOT NULL,
            last_run        TEXT,
            last_status     TEXT,               -- 'success' | 'failed' | NULL
            run_count       INTEGER NOT NULL DEFAULT 0,
            cron_expression TEXT,
            repository      TEXT,
            branch          TEXT,
            commit_sha      TEXT,
            UNIQUE(project_name, script_name, version)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_scripts_one_active
            ON scripts(project_name, script_name) WHERE is_active = 1;
        CREATE INDEX IF NOT EXISTS idx_scripts_repo
            ON scripts(repository, branch);",
    )
}

fn create_executions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS executions (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            project_name TEXT    NOT NULL,
            script_name  TEXT    NOT NULL,
            version      TEXT    NOT NULL,
            env_name     TEXT,
            trigger      TEXT    NOT NULL,  -- 'manual' | 'scheduled'
            started_at   TEXT    NOT NULL,
            finished_at  TEXT    NOT NULL,
            success      INTEGER NOT NULL,
            exit_code    INTEGER,
            stdout       TEXT    NOT NULL DEFAULT '',
            stderr       TEXT    NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_executions_identity
            ON executions(project_name, script_name, id DESC);",
    )
}
