//! Row types returned from and accepted by the lifecycle controllers.
//! Kept as plain structs (no ORM) over `sqlx::query_as!` the way the
//! teacher's handlers shape their response bodies directly off query
//! results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{JobStatus, Status};

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentBuild {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub environment_uuid: Uuid,
    pub project_path: String,
    pub requested_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize)]
pub struct JupyterBuild {
    pub uuid: Uuid,
    pub requested_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Launching,
    Running,
    Stopping,
    Stopped,
}

impl SessionStatus {
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Launching | Self::Running | Self::Stopping)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractiveSession {
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
    pub status: SessionStatus,
    pub jupyter_server_ip: Option<String>,
    pub notebook_server_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    #[default]
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
    pub status: Status,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub kind: RunKind,
    pub job_uuid: Option<Uuid>,
    pub job_schedule_number: Option<i32>,
    pub pipeline_definition: serde_json::Value,
    pub pipeline_parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunStep {
    pub run_uuid: Uuid,
    pub step_uuid: Uuid,
    pub status: Status,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
    pub pipeline_definition: serde_json::Value,
    pub pipeline_run_spec: serde_json::Value,
    pub job_parameters: serde_json::Value,
    pub schedule: Option<String>,
    pub next_scheduled_time: Option<DateTime<Utc>>,
    pub total_scheduled_executions: i32,
    pub status: JobStatus,
}
