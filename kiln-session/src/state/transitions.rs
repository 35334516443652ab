use crate::error::{KilnError, Result};
use crate::state::schema::Status;

/// Validate a feature status transition is allowed.
pub fn validate_feature_transition(from: Status, to: Status) -> Result<()> {
    let valid = match from {
        Status::Pending => matches!(to, Status::InProgress | Status::Failed),
        Status::InProgress => matches!(to, Status::Complete | Status::Failed),
        Status::Complete | Status::Failed => false, // Terminal states
    };

    if valid {
        Ok(())
    } else {
        Err(KilnError::InvalidTransition {
            entity: "feature",
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Validate a task status transition is allowed.
///
/// `failed -> pending` is the self-healing retry edge; the attempt budget that
/// bounds it is enforced by the scheduler, not here.
pub fn validate_task_transition(from: Status, to: Status) -> Result<()> {
    let valid = match from {
        Status::Pending => matches!(to, Status::InProgress | Status::Failed),
        Status::InProgress => matches!(to, Status::Complete | Status::Failed),
        Status::Failed => matches!(to, Status::Pending),
        Status::Complete => false,
    };

    if valid {
        Ok(())
    } else {
        Err(KilnError::InvalidTransition {
            entity: "task",
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Get valid task transitions from a status.
pub fn valid_task_transitions(from: Status) -> Vec<Status> {
    match from {
        Status::Pending => vec![Status::InProgress, Status::Failed],
        Status::InProgress => vec![Status::Complete, Status::Failed],
        Status::Failed => vec![Status::Pending],
        Status::Complete => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_transitions() {
        assert!(validate_feature_transition(Status::Pending, Status::InProgress).is_ok());
        assert!(validate_feature_transition(Status::InProgress, Status::Complete).is_ok());
        assert!(validate_feature_transition(Status::InProgress, Status::Failed).is_ok());
        // A feature can fail before its first task is dispatched
        assert!(validate_feature_transition(Status::Pending, Status::Failed).is_ok());

        assert!(validate_feature_transition(Status::Pending, Status::Complete).is_err());
        assert!(validate_feature_transition(Status::Complete, Status::InProgress).is_err());
        assert!(validate_feature_transition(Status::Failed, Status::Pending).is_err());
    }

    #[test]
    fn test_task_transitions() {
        assert!(validate_task_transition(Status::Pending, Status::InProgress).is_ok());
        assert!(validate_task_transition(Status::InProgress, Status::Complete).is_ok());
        assert!(validate_task_transition(Status::InProgress, Status::Failed).is_ok());
        assert!(validate_task_transition(Status::Failed, Status::Pending).is_ok());
        // Exhausted tasks are force-failed straight from pending
        assert!(validate_task_transition(Status::Pending, Status::Failed).is_ok());

        assert!(validate_task_transition(Status::Pending, Status::Complete).is_err());
        assert!(validate_task_transition(Status::Complete, Status::Pending).is_err());
        assert!(validate_task_transition(Status::Failed, Status::Complete).is_err());
    }

    #[test]
    fn test_valid_task_transitions_match_validation() {
        for from in [
            Status::Pending,
            Status::InProgress,
            Status::Complete,
            Status::Failed,
        ] {
            for to in valid_task_transitions(from) {
                assert!(validate_task_transition(from, to).is_ok());
            }
        }
    }

    #[test]
    fn test_transition_error_message() {
        let err = validate_task_transition(Status::Complete, Status::Pending).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid task transition: cannot go from 'complete' to 'pending'"
        );
    }
}
