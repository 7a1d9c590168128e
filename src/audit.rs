//! Best-effort audit trail of controller transitions. A failure to write
//! an audit row never fails the request it's recording — the row is a
//! convenience for operators, not a source of truth for the state
//! machine.

use sqlx::PgPool;
use uuid::Uuid;

pub struct AuditEntry<'a> {
    /// The controller transition, e.g. `"environment_build.create"`.
    pub action: &'a str,
    pub resource: &'a str,
    pub resource_id: Option<Uuid>,
    pub project_uuid: Option<Uuid>,
    pub detail: Option<serde_json::Value>,
}

pub async fn write_audit(pool: &PgPool, entry: &AuditEntry<'_>) {
    let result = sqlx::query!(
        r#"
        INSERT INTO audit_log (action, resource, resource_id, project_uuid, detail)
        VALUES ($1, $2, $3, $4, $5)
        "#,
        entry.action,
        entry.resource,
        entry.resource_id,
        entry.project_uuid,
        entry.detail,
    )
    .execute(pool)
    .await;

    if let Err(err) = result {
        tracing::warn!(error = %err, action = entry.action, "failed to write audit log entry");
    }
}
