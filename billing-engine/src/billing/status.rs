//! Account status classification and the account-status state machine.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AccountStatus, PaymentStatus, Role};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("Invalid account status transition from {from} to {to}")]
    InvalidTransition {
        from: AccountStatus,
        to: AccountStatus,
    },
}

/// Result of classifying an account's payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub account_status: AccountStatus,
    pub payment_status: PaymentStatus,
}

/// Status write produced by [`plan_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub account_status: AccountStatus,
    pub payment_status: PaymentStatus,
    /// False when only the payment status changes.
    pub account_changed: bool,
}

/// Classify an account from what it has paid against what it owes.
pub fn classify(
    role: Role,
    total_paid: i64,
    required_amount: i64,
    due_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Classification {
    if !role.requires_payment() {
        return Classification {
            account_status: AccountStatus::Active,
            payment_status: PaymentStatus::NoPayment,
        };
    }

    if total_paid <= 0 {
        let overdue = due_date.is_some_and(|due| due < now);
        return if overdue {
            Classification {
                account_status: AccountStatus::Suspended,
                payment_status: PaymentStatus::Overdue,
            }
        } else {
            Classification {
                account_status: AccountStatus::Inactive,
                payment_status: PaymentStatus::NoPayment,
            }
        };
    }

    let payment_status = if total_paid < required_amount {
        PaymentStatus::PartialPaid
    } else {
        PaymentStatus::Paid
    };

    Classification {
        account_status: AccountStatus::Active,
        payment_status,
    }
}

pub fn is_valid_transition(from: AccountStatus, to: AccountStatus) -> bool {
    use AccountStatus::*;
    matches!(
        (from, to),
        (Inactive, Active)
            | (Active, Inactive)
            | (Inactive, Suspended)
            | (Suspended, Inactive)
            | (Active, Suspended)
            | (Suspended, Active)
    )
}

pub fn validate_transition(from: AccountStatus, to: AccountStatus) -> Result<(), StatusError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(StatusError::InvalidTransition { from, to })
    }
}

/// Turn a classification into the status write for an account currently in
/// `current`.
pub fn plan_transition(
    current: AccountStatus,
    classification: Classification,
) -> Result<StatusUpdate, StatusError> {
    if current == classification.account_status {
        return Ok(StatusUpdate {
            account_status: current,
            payment_status: classification.payment_status,
            account_changed: false,
        });
    }

    validate_transition(current, classification.account_status)?;
    Ok(StatusUpdate {
        account_status: classification.account_status,
        payment_status: classification.payment_status,
        account_changed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_exempt_role_is_active() {
        let now = Utc::now();
        let c = classify(Role::Teacher, 0, 50_000, Some(now - Duration::days(3)), now);
        assert_eq!(c.account_status, AccountStatus::Active);
        assert_eq!(c.payment_status, PaymentStatus::NoPayment);
    }

    #[test]
    fn test_no_payment_before_and_after_due() {
        let now = Utc::now();
        let before = classify(Role::Student, 0, 50_000, Some(now + Duration::days(1)), now);
        assert_eq!(before.account_status, AccountStatus::Inactive);
        assert_eq!(before.payment_status, PaymentStatus::NoPayment);

        let after = classify(Role::Student, 0, 50_000, Some(now - Duration::days(1)), now);
        assert_eq!(after.account_status, AccountStatus::Suspended);
        assert_eq!(after.payment_status, PaymentStatus::Overdue);

        let no_due = classify(Role::Student, 0, 50_000, None, now);
        assert_eq!(no_due.account_status, AccountStatus::Inactive);
    }

    #[test]
    fn test_partial_payment_activates() {
        let now = Utc::now();
        let c = classify(
            Role::Student,
            20_000,
            50_000,
            Some(now - Duration::days(10)),
            now,
        );
        assert_eq!(c.account_status, AccountStatus::Active);
        assert_eq!(c.payment_status, PaymentStatus::PartialPaid);
    }

    #[test]
    fn test_partial_payment_before_due_date() {
        let now = Utc::now();
        let c = classify(
            Role::Student,
            30_000,
            50_000,
            Some(now + Duration::days(7)),
            now,
        );
        assert_eq!(c.account_status, AccountStatus::Active);
        assert_eq!(c.payment_status, PaymentStatus::PartialPaid);
    }

    #[test]
    fn test_full_payment() {
        let now = Utc::now();
        let c = classify(Role::Entrepreneur, 150_000, 150_000, None, now);
        assert_eq!(c.account_status, AccountStatus::Active);
        assert_eq!(c.payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn test_transition_table() {
        use AccountStatus::*;
        let all = [Active, Inactive, Suspended];
        for from in all {
            for to in all {
                assert_eq!(is_valid_transition(from, to), from != to);
            }
        }
    }

    #[test]
    fn test_self_transition_rejected() {
        let err = validate_transition(AccountStatus::Active, AccountStatus::Active).unwrap_err();
        assert_eq!(
            err,
            StatusError::InvalidTransition {
                from: AccountStatus::Active,
                to: AccountStatus::Active
            }
        );
        assert_eq!(
            err.to_string(),
            "Invalid account status transition from active to active"
        );
    }

    #[test]
    fn test_plan_transition_payment_only() {
        let update = plan_transition(
            AccountStatus::Active,
            Classification {
                account_status: AccountStatus::Active,
                payment_status: PaymentStatus::PartialPaid,
            },
        )
        .unwrap();
        assert!(!update.account_changed);
        assert_eq!(update.payment_status, PaymentStatus::PartialPaid);
    }

    #[test]
    fn test_plan_transition_suspends() {
        let update = plan_transition(
            AccountStatus::Active,
            Classification {
                account_status: AccountStatus::Suspended,
                payment_status: PaymentStatus::Overdue,
            },
        )
        .unwrap();
        assert!(update.account_changed);
        assert_eq!(update.account_status, AccountStatus::Suspended);
    }
}
