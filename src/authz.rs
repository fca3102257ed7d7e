//! Capability checks for mutating operations.
//!
//! Authentication itself is a collaborator concern; the trusted application
//! layer forwards the caller's role and this module answers the single
//! question `has_permission(role, action)`.

use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Donor,
    Admin,
    Finance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateGift,
    RefundGift,
    CreatePlan,
    UpdatePlan,
    PausePlan,
    ResumePlan,
    CancelPlan,
    ViewAuditLogs,
}

pub fn has_permission(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::Finance => matches!(
            action,
            Action::RefundGift | Action::ViewAuditLogs
        ),
        Role::Donor => matches!(
            action,
            Action::CreateGift
                | Action::CreatePlan
                | Action::UpdatePlan
                | Action::PausePlan
                | Action::ResumePlan
                | Action::CancelPlan
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_donor_cannot_refund() {
        assert!(!has_permission(Role::Donor, Action::RefundGift));
        assert!(!has_permission(Role::Donor, Action::ViewAuditLogs));
    }

    #[test]
    fn test_finance_can_refund_but_not_mutate_plans() {
        assert!(has_permission(Role::Finance, Action::RefundGift));
        assert!(has_permission(Role::Finance, Action::ViewAuditLogs));
        assert!(!has_permission(Role::Finance, Action::CancelPlan));
    }

    #[test]
    fn test_admin_can_do_everything() {
        assert!(has_permission(Role::Admin, Action::RefundGift));
        assert!(has_permission(Role::Admin, Action::CreateGift));
        assert!(has_permission(Role::Admin, Action::CancelPlan));
    }
}
