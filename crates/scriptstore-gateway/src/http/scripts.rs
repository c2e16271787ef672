//! Script lifecycle endpoints: upload, register, run, schedule, status.

use axum::{
    extract::{Multipart, Path, Query, State},
    Json,
};
use scriptstore_core::{ExecutionEntry, Identity, ScriptRecord, SourceMetadata, Trigger};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::ApiError;
use crate::app::AppState;

/// Largest archive accepted by `POST /scripts/upload`.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

const DEFAULT_RUNS_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub project_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub project_name: String,
    /// Whitespace-separated arguments passed to the entry point.
    pub params: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub project_name: String,
    pub cron_expression: String,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub project_name: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub script_name: String,
    pub project_name: String,
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub commit_sha: String,
    pub cron_expression: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// POST /scripts/upload (multipart: project_name, script_name, file, cron_expression?)
pub async fn upload_script(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut project_name = None;
    let mut script_name = None;
    let mut cron_expression = None;
    let mut archive: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                archive = Some((filename, data.to_vec()));
            }
            "project_name" | "script_name" | "cron_expression" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                let value = value.trim().to_string();
                match name.as_str() {
                    "project_name" => project_name = Some(value),
                    "script_name" => script_name = Some(value),
                    _ => cron_expression = Some(value).filter(|v| !v.is_empty()),
                }
            }
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let project_name = project_name.ok_or_else(|| missing("project_name"))?;
    let script_name = script_name.ok_or_else(|| missing("script_name"))?;
    let (filename, bytes) = archive.ok_or_else(|| missing("file"))?;
    let identity = Identity::new(project_name, script_name);

    info!(
        project = %identity.project_name,
        script = %identity.script_name,
        filename = %filename,
        bytes = bytes.len(),
        "upload received"
    );
    let deployment = state
        .deployer
        .deploy_archive(&identity, &filename, bytes, cron_expression.as_deref())
        .await?;

    Ok(Json(json!({
        "status": "success",
        "message": "Script uploaded successfully",
        "version": deployment.record.version,
        "superseded": deployment.superseded,
        "validation": deployment.message,
        "cron_expression": deployment.record.cron_expression,
    })))
}

fn missing(field: &str) -> ApiError {
    ApiError::bad_request(format!("Missing field: {field}"))
}

/// POST /scripts/register - artifact already placed on disk by CI.
pub async fn register_script(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = Identity::new(req.project_name, req.script_name);
    let source = SourceMetadata {
        repository: Some(req.repository),
        branch: Some(req.branch),
        commit_sha: Some(req.commit_sha),
    };
    let deployment = state
        .deployer
        .register_existing(&identity, source, req.cron_expression.as_deref())
        .await?;

    Ok(Json(json!({
        "status": "success",
        "message": "Script registered successfully",
        "version": deployment.record.version,
        "superseded": deployment.superseded,
    })))
}

/// GET /scripts - every record, active and retired.
pub async fn list_scripts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ScriptRecord>>, ApiError> {
    Ok(Json(state.registry.list_all()?))
}

/// POST /scripts/{script_name}/run?project_name=&params=
pub async fn run_script(
    State(state): State<Arc<AppState>>,
    Path(script_name): Path<String>,
    Query(q): Query<RunQuery>,
) -> Result<Json<Value>, ApiError> {
    let identity = Identity::new(q.project_name, script_name);
    let report = state
        .executor
        .execute(&identity, q.params.as_deref(), Trigger::Manual)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "version": report.version,
        "exit_code": report.exit_code,
        "output": report.output,
        "error": report.error,
    })))
}

/// POST /scripts/{script_name}/schedule?project_name=&cron_expression=
pub async fn schedule_script(
    State(state): State<Arc<AppState>>,
    Path(script_name): Path<String>,
    Query(q): Query<ScheduleQuery>,
) -> Result<Json<Value>, ApiError> {
    let identity = Identity::new(q.project_name, script_name);
    let job = state.scheduler.schedule(&identity, &q.cron_expression)?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("Script scheduled with cron expression: {}", job.cron_expression),
        "next_run": job.next_run,
    })))
}

/// DELETE /scripts/{script_name}/schedule?project_name=
pub async fn unschedule_script(
    State(state): State<Arc<AppState>>,
    Path(script_name): Path<String>,
    Query(q): Query<ProjectQuery>,
) -> Result<Json<Value>, ApiError> {
    let identity = Identity::new(q.project_name, script_name);
    let removed = state.scheduler.unschedule(&identity)?;
    Ok(Json(json!({ "status": "success", "removed": removed })))
}

/// GET /scripts/{script_name}/status?project_name=
pub async fn script_status(
    State(state): State<Arc<AppState>>,
    Path(script_name): Path<String>,
    Query(q): Query<ProjectQuery>,
) -> Result<Json<Value>, ApiError> {
    let identity = Identity::new(q.project_name, script_name);
    let record = state.registry.get_active(&identity)?;

    Ok(Json(json!({
        "script_name": record.script_name,
        "project_name": record.project_name,
        "version": record.version,
        "is_active": record.is_active,
        "last_run": record.last_run,
        "last_status": record.last_status,
        "run_count": record.run_count,
        "cron_expression": record.cron_expression,
        "env_name": record.env_name,
    })))
}

/// GET /scripts/{script_name}/runs?project_name=&limit=
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(script_name): Path<String>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Vec<ExecutionEntry>>, ApiError> {
    let identity = Identity::new(q.project_name, script_name);
    let limit = q.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    Ok(Json(state.registry.list_executions(&identity, limit)?))
}
