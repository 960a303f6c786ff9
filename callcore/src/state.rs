//! Call status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created by the caller, not yet surfaced on the receiver's device.
    #[default]
    Calling,
    /// Surfaced on the receiver's device, waiting for an answer.
    Ringing,
    /// Receiver accepted; the call is live.
    Accepted,
    /// Receiver declined. Terminal.
    Rejected,
    /// Hung up (or expired) by either side. Terminal.
    Ended,
}

impl CallStatus {
    /// `rejected` and `ended` are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended)
    }

    /// Waiting on the receiver: `calling` or `ringing`.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }

    pub fn can_answer(self) -> bool {
        self.is_pending()
    }

    /// Apply a transition, returning the next status.
    ///
    /// Every `(status, transition)` pair is spelled out; anything not listed
    /// is an [`InvalidTransition`].
    pub fn transition(self, transition: CallTransition) -> Result<Self, InvalidTransition> {
        use CallStatus::*;
        use CallTransition::*;

        match (self, transition) {
            (Calling, Ring) => Ok(Ringing),
            (Calling | Ringing, Accept) => Ok(Accepted),
            (Calling | Ringing, Reject) => Ok(Rejected),
            (Calling | Ringing | Accepted, End) => Ok(Ended),
            (Ringing, Ring)
            | (Accepted, Ring | Accept | Reject)
            | (Rejected, Ring | Accept | Reject | End)
            | (Ended, Ring | Accept | Reject | End) => Err(InvalidTransition {
                current: self,
                attempted: transition,
            }),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Events that move a session through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTransition {
    /// The receiver's device surfaced the call.
    Ring,
    /// The receiver accepted.
    Accept,
    /// The receiver declined.
    Reject,
    /// Either participant hung up, or the call expired unanswered.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallStatus,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}
