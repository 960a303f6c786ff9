//! Call session record and its signaling fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::state::{CallStatus, CallTransition, InvalidTransition};
use crate::types::{CallId, ConversationId, IceCandidate, Role, SessionDescription, UserId};

/// Why a session reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// A participant hung up.
    Hangup,
    /// The receiver declined.
    Rejected,
    /// Expired while still waiting for the receiver.
    Unanswered,
}

/// Point-in-time view of the signaling fields of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingSnapshot {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub caller_candidates: Vec<IceCandidate>,
    pub receiver_candidates: Vec<IceCandidate>,
}

impl SignalingSnapshot {
    /// Candidates published by the given side, in append order.
    pub fn candidates_from(&self, role: Role) -> &[IceCandidate] {
        match role {
            Role::Caller => &self.caller_candidates,
            Role::Receiver => &self.receiver_candidates,
        }
    }
}

/// Full call session information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub conversation_id: ConversationId,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub caller_candidates: Vec<IceCandidate>,
    pub receiver_candidates: Vec<IceCandidate>,
    pub created_at: DateTime<Utc>,
    /// Set when the receiver accepts.
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole seconds between `started_at` and `ended_at`. Only set on `ended`.
    pub duration_secs: Option<u64>,
    pub end_reason: Option<EndReason>,
    pub ended_by: Option<UserId>,
}

impl CallSession {
    pub fn new(
        id: CallId,
        caller_id: UserId,
        receiver_id: UserId,
        conversation_id: ConversationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            caller_id,
            receiver_id,
            conversation_id,
            status: CallStatus::Calling,
            offer: None,
            answer: None,
            caller_candidates: Vec::new(),
            receiver_candidates: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            end_reason: None,
            ended_by: None,
        }
    }

    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if *user == self.caller_id {
            Some(Role::Caller)
        } else if *user == self.receiver_id {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    pub fn participant(&self, role: Role) -> &UserId {
        match role {
            Role::Caller => &self.caller_id,
            Role::Receiver => &self.receiver_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds elapsed since acceptance, floored. Zero if never accepted.
    pub fn duration_at(&self, now: DateTime<Utc>) -> u64 {
        match self.started_at {
            Some(started) => {
                let millis = now.signed_duration_since(started).num_milliseconds();
                (millis.max(0) / 1000) as u64
            }
            None => 0,
        }
    }

    /// Apply a state transition, stamping the timestamps it implies.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let next = self.status.transition(transition)?;
        match next {
            CallStatus::Accepted => self.started_at = Some(now),
            CallStatus::Rejected => {
                self.ended_at = Some(now);
                self.end_reason = Some(EndReason::Rejected);
            }
            CallStatus::Ended => {
                self.duration_secs = Some(self.duration_at(now));
                self.ended_at = Some(now);
                self.end_reason.get_or_insert(EndReason::Hangup);
            }
            CallStatus::Calling | CallStatus::Ringing => {}
        }
        self.status = next;
        Ok(())
    }

    /// Move into `ended`, recording who ended it and why. Returns the duration.
    pub fn end(
        &mut self,
        now: DateTime<Utc>,
        reason: EndReason,
        by: Option<UserId>,
    ) -> Result<u64, InvalidTransition> {
        let previous_reason = self.end_reason.replace(reason);
        if let Err(e) = self.apply_transition(CallTransition::End, now) {
            self.end_reason = previous_reason;
            return Err(e);
        }
        self.ended_by = by;
        Ok(self.duration_secs.unwrap_or(0))
    }

    pub fn set_offer(&mut self, sdp: SessionDescription) -> Result<(), CallError> {
        self.ensure_writable("offer")?;
        assign_once(&mut self.offer, sdp, "offer")
    }

    pub fn set_answer(&mut self, sdp: SessionDescription) -> Result<(), CallError> {
        self.ensure_writable("answer")?;
        assign_once(&mut self.answer, sdp, "answer")
    }

    /// Append a candidate to the sender's list. Returns the list length after
    /// the append.
    pub fn push_candidate(
        &mut self,
        from: Role,
        candidate: IceCandidate,
        max_candidates: usize,
    ) -> Result<usize, CallError> {
        self.ensure_writable("candidate")?;
        if self.candidate_count() >= max_candidates {
            return Err(CallError::Conflict(format!(
                "call {} reached the limit of {} ice candidates",
                self.id, max_candidates
            )));
        }
        let list = match from {
            Role::Caller => &mut self.caller_candidates,
            Role::Receiver => &mut self.receiver_candidates,
        };
        list.push(candidate);
        Ok(list.len())
    }

    pub fn candidate_count(&self) -> usize {
        self.caller_candidates.len() + self.receiver_candidates.len()
    }

    pub fn signaling(&self) -> SignalingSnapshot {
        SignalingSnapshot {
            offer: self.offer.clone(),
            answer: self.answer.clone(),
            caller_candidates: self.caller_candidates.clone(),
            receiver_candidates: self.receiver_candidates.clone(),
        }
    }

    fn ensure_writable(&self, what: &str) -> Result<(), CallError> {
        if self.is_terminal() {
            return Err(CallError::Conflict(format!(
                "cannot write {} to call {} in state {}",
                what, self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Single-assignment write. Repeating the stored value is accepted so that a
/// retried write is harmless.
fn assign_once(
    slot: &mut Option<SessionDescription>,
    value: SessionDescription,
    what: &str,
) -> Result<(), CallError> {
    match slot {
        Some(existing) if *existing == value => Ok(()),
        Some(_) => Err(CallError::Conflict(format!("{what} already set"))),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}
