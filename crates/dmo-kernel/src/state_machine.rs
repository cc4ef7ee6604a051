//! Workflow stages and the legal moves between them.
//!
//! A session walks `Idle` through discovery, validation and generation to the
//! approval gate, then on to execution. Any working stage may drop to
//! `Failed`; `Denied`, `Completed` and `Failed` are terminal.

use crate::error::StateMachineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of a migration workflow session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Configured, nothing running
    Idle,
    /// Inventorying both databases
    Discovering,
    /// Checking compatibility and running the sample copy
    Validating,
    /// Planning and asking the advisory service
    Generating,
    /// Suspended on a human decision
    AwaitingApproval,
    /// Approved, execution about to start
    Approved,
    /// Rejected by a human or by the approval timeout
    Denied,
    /// Engine running
    Executing,
    /// Execution finished with at least one table copied
    Completed,
    /// A stage failed or the run was cancelled
    Failed,
}

impl WorkflowStage {
    /// Every stage, in workflow order
    pub const ALL: [WorkflowStage; 10] = [
        Self::Idle,
        Self::Discovering,
        Self::Validating,
        Self::Generating,
        Self::AwaitingApproval,
        Self::Approved,
        Self::Denied,
        Self::Executing,
        Self::Completed,
        Self::Failed,
    ];

    /// A session in a live stage blocks a new `start`
    #[inline]
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Completed | Self::Failed | Self::Denied
        )
    }

    /// End of a session
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }

    /// Stages where background work is in progress and `cancel` applies
    #[inline]
    #[must_use]
    pub fn is_working(self) -> bool {
        matches!(
            self,
            Self::Discovering
                | Self::Validating
                | Self::Generating
                | Self::Approved
                | Self::Executing
        )
    }

    /// Stages from which `start` is accepted
    #[inline]
    #[must_use]
    pub fn accepts_start(self) -> bool {
        !self.is_live()
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Validating => "validating",
            Self::Generating => "generating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a stage transition within one session.
///
/// Terminal stages have no exits: a new `start` replaces the session.
pub fn validate_transition(from: WorkflowStage, to: WorkflowStage) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Stages reachable from `from` in one step, empty for terminal stages
#[must_use]
pub fn allowed_transitions(from: WorkflowStage) -> &'static [WorkflowStage] {
    use WorkflowStage::*;
    match from {
        Idle => &[Discovering],
        Discovering => &[Validating, Failed],
        Validating => &[Generating, Failed],
        Generating => &[AwaitingApproval, Failed],
        AwaitingApproval => &[Approved, Denied],
        Approved => &[Executing, Failed],
        Executing => &[Completed, Failed],
        Denied | Completed | Failed => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use WorkflowStage::*;

    fn any_stage() -> impl Strategy<Value = WorkflowStage> {
        prop::sample::select(WorkflowStage::ALL.to_vec())
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Idle,
            Discovering,
            Validating,
            Generating,
            AwaitingApproval,
            Approved,
            Executing,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn test_approval_gate_exits() {
        assert_eq!(allowed_transitions(AwaitingApproval), &[Approved, Denied]);
        assert!(validate_transition(AwaitingApproval, Executing).is_err());
        assert!(validate_transition(AwaitingApproval, Failed).is_err());
        assert!(validate_transition(Generating, Executing).is_err());
    }

    #[test]
    fn test_live_and_terminal_partition() {
        for stage in WorkflowStage::ALL {
            assert!(!(stage.is_live() && stage.accepts_start()));
            if stage.is_terminal() {
                assert!(allowed_transitions(stage).is_empty());
            }
        }
        assert!(Idle.accepts_start());
        assert!(!AwaitingApproval.is_working());
        assert!(AwaitingApproval.is_live());
    }

    proptest! {
        #[test]
        fn prop_executing_only_reachable_from_approved(from in any_stage()) {
            if validate_transition(from, Executing).is_ok() {
                prop_assert_eq!(from, Approved);
            }
        }

        #[test]
        fn prop_every_working_stage_can_fail(stage in any_stage()) {
            if stage.is_working() {
                prop_assert!(validate_transition(stage, Failed).is_ok());
            }
        }

        #[test]
        fn prop_transitions_never_return_to_idle(from in any_stage(), to in any_stage()) {
            if validate_transition(from, to).is_ok() {
                prop_assert_ne!(to, Idle);
            }
        }
    }
}
