pub mod audit_logs;
pub mod gifts;
pub mod plans;
pub mod webhooks;

use axum::http::HeaderMap;

use crate::authz::{has_permission, Action, Role};
use crate::error::{AppError, Result};

/// Caller role, forwarded by the trusted application layer. Absent or
/// unknown roles degrade to the least-privileged one.
pub(crate) fn role_from_headers(headers: &HeaderMap) -> Role {
    headers
        .get("x-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Role::Donor)
}

/// Capability gate for mutating operations.
pub(crate) fn require_permission(headers: &HeaderMap, action: Action) -> Result<Role> {
    let role = role_from_headers(headers);
    if has_permission(role, action) {
        Ok(role)
    } else {
        Err(AppError::Forbidden(format!(
            "role {} may not perform this action",
            role.as_ref()
        )))
    }
}

/// Gift and plan amounts share the same accepted range.
pub(crate) fn validate_amount(amount_cents: i64) -> Result<()> {
    use crate::models::{MAX_GIFT_CENTS, MIN_GIFT_CENTS};
    if !(MIN_GIFT_CENTS..=MAX_GIFT_CENTS).contains(&amount_cents) {
        return Err(AppError::BadRequest(format!(
            "amount must be between {} and {} cents",
            MIN_GIFT_CENTS, MAX_GIFT_CENTS
        )));
    }
    Ok(())
}

/// Minimal shape check for donor emails; full validation is the form
/// layer's concern upstream.
pub(crate) fn validate_email(email: &str) -> Result<()> {
    let valid = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
    });
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest("invalid email address".into()))
    }
}
