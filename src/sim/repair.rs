//! Per-side choice repair state machine.
//!
//! ```text
//! Idle -> AwaitingChoice -> Accepted (new request, no error) -> Idle
//!                        -> RejectedFirst -> Repairing -> AwaitingChoice
//!                        -> RejectedRepeat -> Fatal
//! ```
//!
//! Exactly one repair is allowed per streak. A streak ends when a request
//! arrives without an intervening error or when the turn advances.

use tracing::{info, warn};

use crate::sim::choice::{classify_rejection, is_invalid_choice_error, RejectionKind};

pub const MAX_REPAIRS_PER_STREAK: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairState {
    Idle,
    AwaitingChoice { choice: String, repairs: u32 },
    Repairing { rejected: String, error: String, repairs: u32 },
    Fatal { attempted: String, error: String, repairs: u32 },
}

/// What the driver must do after an engine error line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairVerdict {
    /// Not a choice rejection, or nothing was awaiting.
    Ignore,
    Repair { kind: RejectionKind, rejected: String },
    Fatal { attempted: String, repairs: u32 },
}

#[derive(Debug)]
pub struct SideRepair {
    side: &'static str,
    state: RepairState,
    total_repairs: u32,
}

impl SideRepair {
    pub fn new(side: &'static str) -> Self {
        Self {
            side,
            state: RepairState::Idle,
            total_repairs: 0,
        }
    }

    pub fn state(&self) -> &RepairState {
        &self.state
    }

    pub fn total_repairs(&self) -> u32 {
        self.total_repairs
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.state, RepairState::Fatal { .. })
    }

    fn streak_repairs(&self) -> u32 {
        match &self.state {
            RepairState::Idle => 0,
            RepairState::AwaitingChoice { repairs, .. }
            | RepairState::Repairing { repairs, .. }
            | RepairState::Fatal { repairs, .. } => *repairs,
        }
    }

    pub fn choice_sent(&mut self, choice: &str) {
        if self.is_fatal() {
            return;
        }
        let repairs = self.streak_repairs();
        self.state = RepairState::AwaitingChoice {
            choice: choice.to_string(),
            repairs,
        };
    }

    /// A new request for this side. Ends the streak when the last choice
    /// was not rejected.
    pub fn request_received(&mut self) {
        if let RepairState::AwaitingChoice { .. } = self.state {
            self.state = RepairState::Idle;
        }
    }

    pub fn turn_advanced(&mut self) {
        if !self.is_fatal() {
            self.state = RepairState::Idle;
        }
    }

    pub fn error_received(&mut self, error: &str) -> RepairVerdict {
        if !is_invalid_choice_error(error) {
            return RepairVerdict::Ignore;
        }
        match std::mem::replace(&mut self.state, RepairState::Idle) {
            RepairState::AwaitingChoice { choice, repairs } if repairs < MAX_REPAIRS_PER_STREAK => {
                let kind = classify_rejection(error);
                warn!(side = self.side, error, choice = %choice, ?kind, "invalid choice detected; repairing");
                self.total_repairs += 1;
                self.state = RepairState::Repairing {
                    rejected: choice.clone(),
                    error: error.to_string(),
                    repairs: repairs + 1,
                };
                RepairVerdict::Repair { kind, rejected: choice }
            }
            RepairState::AwaitingChoice { choice, repairs } => {
                warn!(side = self.side, error, choice = %choice, repairs, "invalid choice after repair; giving up");
                self.state = RepairState::Fatal {
                    attempted: choice.clone(),
                    error: error.to_string(),
                    repairs,
                };
                RepairVerdict::Fatal {
                    attempted: choice,
                    repairs,
                }
            }
            other => {
                info!(side = self.side, error, "choice error with no choice awaiting; ignoring");
                self.state = other;
                RepairVerdict::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEEDS: &str = "[Invalid choice] Can't move: Aura Sphere needs a target";

    #[test]
    fn test_accepted_choice_returns_to_idle() {
        let mut r = SideRepair::new("p1");
        r.choice_sent("move 1 1");
        r.request_received();
        assert_eq!(r.state(), &RepairState::Idle);
    }

    #[test]
    fn test_exactly_one_repair_then_fatal() {
        let mut r = SideRepair::new("p1");
        r.choice_sent("move 1");
        let v = r.error_received(NEEDS);
        assert_eq!(
            v,
            RepairVerdict::Repair {
                kind: RejectionKind::NeedsTarget,
                rejected: "move 1".into()
            }
        );
        // The engine may resend the request after an error; the streak continues.
        r.request_received();
        r.choice_sent("move 1 1");
        let v = r.error_received(NEEDS);
        assert_eq!(
            v,
            RepairVerdict::Fatal {
                attempted: "move 1 1".into(),
                repairs: 1
            }
        );
        assert!(r.is_fatal());
        r.turn_advanced();
        assert!(r.is_fatal(), "fatal is terminal");
    }

    #[test]
    fn test_streak_resets_after_acceptance_and_turn() {
        let mut r = SideRepair::new("p2");
        r.choice_sent("move 1");
        assert!(matches!(r.error_received(NEEDS), RepairVerdict::Repair { .. }));
        r.choice_sent("move 1 1");
        r.turn_advanced();
        r.choice_sent("move 2");
        assert!(matches!(r.error_received(NEEDS), RepairVerdict::Repair { .. }));
        assert_eq!(r.total_repairs(), 2);
    }

    #[test]
    fn test_unrelated_errors_ignored() {
        let mut r = SideRepair::new("p1");
        assert_eq!(r.error_received(NEEDS), RepairVerdict::Ignore, "nothing awaiting");
        r.choice_sent("move 1");
        assert_eq!(r.error_received("some other message"), RepairVerdict::Ignore);
        assert!(matches!(r.state(), RepairState::AwaitingChoice { .. }));
    }
}
