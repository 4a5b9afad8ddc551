//! Replication State Machine
//!
//! Table-driven transition legality over the six unified states. Every
//! verdict carries a reason string: legal reasons say what the transition
//! accomplishes, illegal reasons say why it is disallowed. The wording is
//! surfaced in status conditions and pinned by tests.

use crate::crd::ReplicationState;
use crate::error::{Error, Result};

use ReplicationState::{Demoting, Failed, Promoting, Replica, Source, Syncing};

// =============================================================================
// Verdict Types
// =============================================================================

/// What a legal transition does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Requested state equals current state
    Steady,
    /// Starts a two-step promotion, demotion or resync
    Begin,
    /// Finishes a two-step operation
    Complete,
    /// Reverses an operation that is in progress
    Reverse,
    /// Failure interrupts whatever was happening
    Fail,
    /// Leaves the failed state
    Recover,
}

/// Outcome of a legality check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionVerdict {
    pub from: ReplicationState,
    pub to: ReplicationState,
    /// `None` when the transition is illegal
    pub kind: Option<TransitionKind>,
    pub reason: &'static str,
}

impl TransitionVerdict {
    pub fn is_allowed(&self) -> bool {
        self.kind.is_some()
    }

    /// Whether the backend has to be told anything
    pub fn requires_backend_change(&self) -> bool {
        !matches!(self.kind, Some(TransitionKind::Steady) | None)
    }
}

// =============================================================================
// Transition Table
// =============================================================================

fn lookup(from: ReplicationState, to: ReplicationState) -> (Option<TransitionKind>, &'static str) {
    use TransitionKind::*;

    match (from, to) {
        // Failure can interrupt any operation
        (Failed, Failed) => (Some(Steady), "failed can remain failed until recovery begins"),
        (_, Failed) => (Some(Fail), match from {
            Source => "source can be marked failed at any time",
            Replica => "replica can be marked failed at any time",
            Promoting => "promoting can be marked failed at any time",
            Demoting => "demoting can be marked failed at any time",
            _ => "syncing can be marked failed at any time",
        }),

        (Source, Source) => (Some(Steady), "source can remain source with no backend change"),
        (Source, Replica) => (None, "source cannot become replica directly; it must be demoted first"),
        (Source, Promoting) => (None, "source cannot be promoted because it is already the source"),
        (Source, Demoting) => (Some(Begin), "source can begin demotion to replica"),
        (Source, Syncing) => (None, "source cannot resynchronize; only a replica resynchronizes from its source"),

        (Replica, Source) => (None, "replica cannot become source directly; it must be promoted first"),
        (Replica, Replica) => (Some(Steady), "replica can remain replica with no backend change"),
        (Replica, Promoting) => (Some(Begin), "replica can begin promotion to source"),
        (Replica, Demoting) => (None, "replica cannot be demoted because it is already a replica"),
        (Replica, Syncing) => (Some(Begin), "replica can resynchronize from its source"),

        (Promoting, Source) => (Some(Complete), "promotion completes and the volume becomes the source"),
        (Promoting, Replica) => (None, "promoting cannot return to replica directly; it must be demoted or finish promotion first"),
        (Promoting, Promoting) => (Some(Steady), "promoting can continue while the promotion is in progress"),
        (Promoting, Demoting) => (Some(Reverse), "promoting can be reversed by beginning demotion"),
        (Promoting, Syncing) => (None, "promoting cannot resynchronize while a promotion is in progress"),

        (Demoting, Source) => (None, "demoting cannot return to source directly; it must be promoted or finish demotion first"),
        (Demoting, Replica) => (Some(Complete), "demotion completes and the volume becomes a replica"),
        (Demoting, Promoting) => (Some(Reverse), "demoting can be reversed by beginning promotion"),
        (Demoting, Demoting) => (Some(Steady), "demoting can continue while the demotion is in progress"),
        (Demoting, Syncing) => (None, "demoting cannot resynchronize until the demotion has finished"),

        (Syncing, Source) => (None, "syncing cannot become source directly; it must finish resynchronizing and be promoted"),
        (Syncing, Replica) => (Some(Complete), "resynchronization completes and the volume becomes a replica"),
        (Syncing, Promoting) => (None, "syncing cannot be promoted until resynchronization has finished"),
        (Syncing, Demoting) => (None, "syncing cannot be demoted because it is not the source"),
        (Syncing, Syncing) => (Some(Steady), "syncing can continue while resynchronization is in progress"),

        (Failed, Syncing) => (Some(Recover), "failed can recover by resynchronizing from its source"),
        (Failed, Source) => (None, "failed cannot become source directly; it must resynchronize first"),
        (Failed, Replica) => (None, "failed cannot become replica directly; it must resynchronize first"),
        (Failed, Promoting) => (None, "failed cannot be promoted directly; it must resynchronize first"),
        (Failed, Demoting) => (None, "failed cannot be demoted directly; it must resynchronize first"),
    }
}

/// Decide whether `from -> to` is legal
pub fn evaluate(from: ReplicationState, to: ReplicationState) -> TransitionVerdict {
    let (kind, reason) = lookup(from, to);
    TransitionVerdict {
        from,
        to,
        kind,
        reason,
    }
}

/// Like [`evaluate`], but an illegal transition is an error
pub fn validate(from: ReplicationState, to: ReplicationState) -> Result<TransitionVerdict> {
    let verdict = evaluate(from, to);
    if verdict.is_allowed() {
        Ok(verdict)
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: verdict.reason.to_string(),
        })
    }
}

/// States reachable from `from` in one step
pub fn legal_targets(from: ReplicationState) -> Vec<ReplicationState> {
    ReplicationState::ALL
        .into_iter()
        .filter(|to| evaluate(from, *to).is_allowed())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_two_step_promotion_and_demotion() {
        assert!(evaluate(Replica, Promoting).is_allowed());
        assert!(evaluate(Promoting, Source).is_allowed());
        assert!(evaluate(Source, Demoting).is_allowed());
        assert!(evaluate(Demoting, Replica).is_allowed());
    }

    #[test]
    fn test_promoting_to_replica_is_illegal() {
        let verdict = evaluate(Promoting, Replica);
        assert!(!verdict.is_allowed());
        assert_eq!(
            verdict.reason,
            "promoting cannot return to replica directly; it must be demoted or finish promotion first"
        );
    }

    #[test]
    fn test_failure_always_legal() {
        for from in ReplicationState::ALL {
            assert!(evaluate(from, Failed).is_allowed(), "{} -> failed", from);
        }
    }

    #[test]
    fn test_failed_recovery_path() {
        let verdict = evaluate(Failed, Syncing);
        assert_eq!(verdict.kind, Some(TransitionKind::Recover));
        assert_eq!(verdict.reason, "failed can recover by resynchronizing from its source");

        let verdict = evaluate(Failed, Promoting);
        assert!(!verdict.is_allowed());
        assert_eq!(
            verdict.reason,
            "failed cannot be promoted directly; it must resynchronize first"
        );
    }

    #[test]
    fn test_verbatim_legal_reasons() {
        assert_eq!(evaluate(Replica, Promoting).reason, "replica can begin promotion to source");
        assert_eq!(
            evaluate(Promoting, Source).reason,
            "promotion completes and the volume becomes the source"
        );
        assert_eq!(evaluate(Source, Demoting).reason, "source can begin demotion to replica");
        assert_eq!(
            evaluate(Demoting, Replica).reason,
            "demotion completes and the volume becomes a replica"
        );
    }

    #[test]
    fn test_exhaustive_reason_markers() {
        let mut pairs = 0;
        for from in ReplicationState::ALL {
            for to in ReplicationState::ALL {
                pairs += 1;
                let verdict = evaluate(from, to);
                if verdict.is_allowed() {
                    assert!(
                        !verdict.reason.contains("cannot")
                            && (verdict.reason.contains("can") || verdict.reason.contains("completes")),
                        "legal {} -> {}: {}",
                        from,
                        to,
                        verdict.reason
                    );
                } else {
                    assert!(
                        verdict.reason.contains("cannot"),
                        "illegal {} -> {}: {}",
                        from,
                        to,
                        verdict.reason
                    );
                }
            }
        }
        assert_eq!(pairs, 36);
    }

    #[test]
    fn test_steady_state_needs_no_backend_change() {
        for state in ReplicationState::ALL {
            let verdict = evaluate(state, state);
            assert_eq!(verdict.kind, Some(TransitionKind::Steady));
            assert!(!verdict.requires_backend_change());
        }
        assert!(evaluate(Replica, Syncing).requires_backend_change());
    }

    #[test]
    fn test_validate_returns_error() {
        assert_matches!(
            validate(Replica, Source),
            Err(Error::InvalidTransition { ref reason, .. })
                if reason == "replica cannot become source directly; it must be promoted first"
        );
        assert!(validate(Replica, Syncing).is_ok());
    }

    #[test]
    fn test_legal_targets() {
        assert_eq!(legal_targets(Failed), vec![Syncing, Failed]);
        assert_eq!(legal_targets(Replica), vec![Replica, Promoting, Syncing, Failed]);
    }
}
