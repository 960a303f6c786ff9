//! Platform-independent core of the call negotiation system.
//!
//! Everything in this crate is synchronous and runtime-agnostic: identifiers,
//! the call status state machine, the session record with its signaling
//! fields, the reader-side candidate tracker and the shared error taxonomy.
//! The `callrelay` crate layers the async manager, relay and negotiation
//! client on top of it.

pub mod candidates;
pub mod clock;
pub mod error;
pub mod session;
pub mod state;
pub mod types;

pub use candidates::CandidateTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CallError, ErrorKind};
pub use session::{CallSession, EndReason, SignalingSnapshot};
pub use state::{CallStatus, CallTransition, InvalidTransition};
pub use types::{CallId, ConversationId, IceCandidate, Role, SessionDescription, UserId};
