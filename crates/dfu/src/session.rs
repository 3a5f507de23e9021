//! Per-transfer state machine.

use std::sync::Mutex;

/// Lifecycle of one logical transfer.
///
/// `Active` advances its target index internally as sub-transfers complete;
/// the final sub-transfer moves to `Completing` when a deferred commit/poll
/// step is required, or straight to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    Negotiating,
    Active { target: usize },
    Paused { target: usize },
    Completing,
    Done,
    Cancelled,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Done | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }
}

/// An operation was requested in a phase that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {phase:?}")]
pub struct StateError {
    pub action: &'static str,
    pub phase: TransferPhase,
}

/// Shared transfer state.
///
/// The mutex is held only for the synchronous mutation itself and is always
/// released before any caller-facing event is emitted, so re-entrant calls
/// from event consumers cannot deadlock.
#[derive(Debug)]
pub struct Session {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    phase: TransferPhase,
    offset: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: TransferPhase::Idle,
                offset: 0,
            }),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.inner.lock().unwrap().phase
    }

    /// Last fully-confirmed byte offset within the active sub-transfer.
    pub fn offset(&self) -> u64 {
        self.inner.lock().unwrap().offset
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        self.inner.lock().unwrap().offset = offset;
    }

    pub(crate) fn begin_negotiation(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            TransferPhase::Idle => {
                inner.phase = TransferPhase::Negotiating;
                Ok(())
            }
            phase => Err(StateError {
                action: "start negotiating",
                phase,
            }),
        }
    }

    /// Enters `Active { target }`: from `Negotiating` at transfer start, from
    /// the previous target on sub-transfer advance, or from `Completing` when
    /// a requested resource arrives.
    pub(crate) fn activate(&self, target: usize) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let allowed = match inner.phase {
            TransferPhase::Negotiating | TransferPhase::Completing => true,
            TransferPhase::Active { target: current } => target == current + 1,
            _ => false,
        };
        if !allowed {
            return Err(StateError {
                action: "activate a sub-transfer",
                phase: inner.phase,
            });
        }
        inner.phase = TransferPhase::Active { target };
        inner.offset = 0;
        Ok(())
    }

    pub(crate) fn pause(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            TransferPhase::Active { target } => {
                inner.phase = TransferPhase::Paused { target };
                Ok(())
            }
            phase => Err(StateError {
                action: "pause",
                phase,
            }),
        }
    }

    /// Re-enters `Active` at the paused sub-transfer; emission resumes from
    /// the last confirmed offset.
    pub(crate) fn resume(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            TransferPhase::Paused { target } => {
                inner.phase = TransferPhase::Active { target };
                Ok(())
            }
            phase => Err(StateError {
                action: "resume",
                phase,
            }),
        }
    }

    pub(crate) fn begin_completion(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            TransferPhase::Active { .. } => {
                inner.phase = TransferPhase::Completing;
                Ok(())
            }
            phase => Err(StateError {
                action: "complete",
                phase,
            }),
        }
    }

    pub(crate) fn finish(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            TransferPhase::Active { .. } | TransferPhase::Completing => {
                inner.phase = TransferPhase::Done;
                Ok(())
            }
            phase => Err(StateError {
                action: "finish",
                phase,
            }),
        }
    }

    /// Moves any non-terminal phase to `Cancelled`. Returns whether the
    /// phase changed.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase.is_terminal() {
            return false;
        }
        inner.phase = TransferPhase::Cancelled;
        true
    }

    /// Moves any non-terminal phase to `Failed`. Returns whether the phase
    /// changed.
    pub(crate) fn fail(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase.is_terminal() {
            return false;
        }
        inner.phase = TransferPhase::Failed;
        true
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_session(target: usize) -> Session {
        let s = Session::new();
        s.begin_negotiation().unwrap();
        for i in 0..=target {
            s.activate(i).unwrap();
        }
        s
    }

    #[test]
    fn happy_path_single_target() {
        let s = Session::new();
        assert_eq!(s.phase(), TransferPhase::Idle);
        s.begin_negotiation().unwrap();
        assert_eq!(s.phase(), TransferPhase::Negotiating);
        s.activate(0).unwrap();
        assert_eq!(s.phase(), TransferPhase::Active { target: 0 });
        s.finish().unwrap();
        assert_eq!(s.phase(), TransferPhase::Done);
        assert!(s.phase().is_terminal());
    }

    #[test]
    fn targets_advance_in_order() {
        let s = active_session(0);
        s.activate(1).unwrap();
        assert_eq!(s.phase(), TransferPhase::Active { target: 1 });

        // Skipping a target is illegal.
        let err = s.activate(3).unwrap_err();
        assert_eq!(err.phase, TransferPhase::Active { target: 1 });
    }

    #[test]
    fn activation_resets_offset() {
        let s = active_session(0);
        s.set_offset(500);
        s.activate(1).unwrap();
        assert_eq!(s.offset(), 0);
    }

    #[test]
    fn cannot_negotiate_twice() {
        let s = Session::new();
        s.begin_negotiation().unwrap();
        let err = s.begin_negotiation().unwrap_err();
        assert_eq!(err.phase, TransferPhase::Negotiating);
    }

    #[test]
    fn pause_resume_roundtrip() {
        let s = active_session(1);
        s.set_offset(200);
        s.pause().unwrap();
        assert_eq!(s.phase(), TransferPhase::Paused { target: 1 });

        s.resume().unwrap();
        assert_eq!(s.phase(), TransferPhase::Active { target: 1 });
        assert_eq!(s.offset(), 200);
    }

    #[test]
    fn pause_outside_active_is_rejected() {
        let s = Session::new();
        assert!(s.pause().is_err());
        s.begin_negotiation().unwrap();
        assert!(s.pause().is_err());
    }

    #[test]
    fn resume_requires_pause() {
        let s = active_session(0);
        let err = s.resume().unwrap_err();
        assert_eq!(err.action, "resume");
    }

    #[test]
    fn completion_path() {
        let s = active_session(0);
        s.begin_completion().unwrap();
        assert_eq!(s.phase(), TransferPhase::Completing);

        // A requested resource re-activates the session.
        s.activate(1).unwrap();
        s.begin_completion().unwrap();
        s.finish().unwrap();
        assert_eq!(s.phase(), TransferPhase::Done);
    }

    #[test]
    fn cancel_from_any_non_terminal_phase() {
        let s = Session::new();
        assert!(s.cancel());
        assert_eq!(s.phase(), TransferPhase::Cancelled);

        let s = active_session(0);
        s.pause().unwrap();
        assert!(s.cancel());

        let s = active_session(0);
        s.begin_completion().unwrap();
        assert!(s.fail());
        assert_eq!(s.phase(), TransferPhase::Failed);
    }

    #[test]
    fn terminal_phases_are_sticky() {
        let s = active_session(0);
        s.finish().unwrap();
        assert!(!s.cancel());
        assert!(!s.fail());
        assert_eq!(s.phase(), TransferPhase::Done);
        assert!(s.activate(1).is_err());
        assert!(s.finish().is_err());
    }

    #[test]
    fn no_resume_after_failure() {
        let s = active_session(0);
        s.fail();
        assert!(s.resume().is_err());
        assert!(s.pause().is_err());
    }
}
