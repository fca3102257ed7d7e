//! Audit trail access for admin and finance tooling.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::get,
    Router,
};

use crate::authz::Action;
use crate::db::{queries, AppState};
use crate::error::Result;
use crate::extractors::Json;
use crate::models::{AuditLog, AuditLogQuery};

use super::require_permission;

pub fn router() -> Router<AppState> {
    Router::new().route("/audit-logs", get(list_audit_logs))
}

/// GET /audit-logs
pub async fn list_audit_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Vec<AuditLog>>> {
    require_permission(&headers, Action::ViewAuditLogs)?;

    let conn = state.audit.get()?;
    let logs = queries::list_audit_logs(&conn, &query)?;
    Ok(Json(logs))
}
