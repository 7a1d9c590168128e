//! Status enums and the single guarded status-update used by every
//! controller and worker. An entity that has reached an end state
//! (`SUCCESS`, `FAILURE`, `ABORTED`) is never updated again — this is
//! what keeps a task-bus worker racing an abort request from clobbering
//! whichever of them lands second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an environment build, Jupyter build, or pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pending,
    Started,
    Success,
    Failure,
    Aborted,
}

impl Status {
    /// Once terminal, never updated again (§4.3).
    pub fn terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }

    fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
        }
    }
}

/// Status of a job, a superset of [`Status`]: jobs additionally have a
/// `DRAFT` state before their first run is scheduled and a `PAUSED`
/// state a user can toggle at will.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Draft,
    Pending,
    Started,
    Paused,
    Success,
    Failure,
    Aborted,
}

impl JobStatus {
    pub fn terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }

    fn as_db_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
        }
    }
}

/// A status update to apply: the new status plus whichever timestamp
/// column it implies (§4.3 — `STARTED` stamps `started_time`,
/// `SUCCESS`/`FAILURE` stamp `finished_time`).
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: Status,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn to(status: Status, now: DateTime<Utc>) -> Self {
        match status {
            Status::Started => Self {
                status,
                started_time: Some(now),
                finished_time: None,
            },
            Status::Success | Status::Failure => Self {
                status,
                started_time: None,
                finished_time: Some(now),
            },
            Status::Pending | Status::Aborted => Self {
                status,
                started_time: None,
                finished_time: None,
            },
        }
    }
}

/// Apply a guarded status update to a row identified by `id`, scoped to
/// `table`. Only rows currently in `PENDING` or `STARTED` are affected;
/// rows already in a terminal state are left untouched. Returns whether
/// a row was actually changed, mirroring the Python implementation's
/// `update_status_db` return value.
///
/// `table` and the id/timestamp column names are trusted literals
/// supplied by call sites in this crate, never user input.
pub async fn update_status_db(
    executor: impl sqlx::PgExecutor<'_>,
    table: &str,
    id_column: &str,
    id: uuid::Uuid,
    update: &StatusUpdate,
) -> Result<bool, sqlx::Error> {
    let query = format!(
        "UPDATE {table} SET status = $1, \
         started_time = COALESCE($2, started_time), \
         finished_time = COALESCE($3, finished_time) \
         WHERE {id_column} = $4 AND status IN ('PENDING', 'STARTED')"
    );

    let result = sqlx::query(&query)
        .bind(update.status.as_db_str())
        .bind(update.started_time)
        .bind(update.finished_time)
        .bind(id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Like [`update_status_db`], but scoped to a composite-key row (used for
/// `pipeline_run_steps`, whose primary key is `(run_uuid, step_uuid)` —
/// `step_uuid` alone is not unique across runs).
pub async fn update_status_db_composite(
    executor: impl sqlx::PgExecutor<'_>,
    table: &str,
    key_columns: [&str; 2],
    key_values: (uuid::Uuid, uuid::Uuid),
    update: &StatusUpdate,
) -> Result<bool, sqlx::Error> {
    let query = format!(
        "UPDATE {table} SET status = $1, \
         started_time = COALESCE($2, started_time), \
         finished_time = COALESCE($3, finished_time) \
         WHERE {} = $4 AND {} = $5 AND status IN ('PENDING', 'STARTED')",
        key_columns[0], key_columns[1],
    );

    let result = sqlx::query(&query)
        .bind(update.status.as_db_str())
        .bind(update.started_time)
        .bind(update.finished_time)
        .bind(key_values.0)
        .bind(key_values.1)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_success_failure_aborted_are_terminal() {
        assert!(!Status::Pending.terminal());
        assert!(!Status::Started.terminal());
        assert!(Status::Success.terminal());
        assert!(Status::Failure.terminal());
        assert!(Status::Aborted.terminal());
    }

    #[test]
    fn job_status_adds_draft_and_paused_as_nonterminal() {
        assert!(!JobStatus::Draft.terminal());
        assert!(!JobStatus::Paused.terminal());
        assert!(JobStatus::Success.terminal());
    }

    #[test]
    fn started_update_stamps_started_time_only() {
        let now = Utc::now();
        let update = StatusUpdate::to(Status::Started, now);
        assert_eq!(update.started_time, Some(now));
        assert_eq!(update.finished_time, None);
    }

    #[test]
    fn success_update_stamps_finished_time_only() {
        let now = Utc::now();
        let update = StatusUpdate::to(Status::Success, now);
        assert_eq!(update.started_time, None);
        assert_eq!(update.finished_time, Some(now));
    }
}
