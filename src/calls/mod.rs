//! Call session lifecycle and signaling relay.
//!
//! # Architecture
//!
//! - [`CallManager`]: owns session records, enforces the status state machine
//!   and guarantees a single non-terminal call per conversation
//! - [`SignalingRelay`]: single-assignment offer/answer plus append-only
//!   candidate lists, observed through [`SignalingFeed`]
//! - [`CallService`]: the authenticated request/response surface
//! - [`IncomingCallNotifier`]: bridges lifecycle events to the notification sink
//! - [`EventBus`]: typed broadcast channels for lifecycle events
//!
//! Session records, statuses and errors are defined in `callcore`.

pub mod events;
mod manager;
mod notify;
mod reaper;
mod registry;
mod relay;
mod service;

pub use callcore::{CallError, CallSession, CallStatus, ErrorKind, SignalingSnapshot};
pub use events::{CallAnswered, CallEnded, CallRinging, EventBus, IncomingCall};
pub use manager::CallManager;
pub use notify::IncomingCallNotifier;
pub use registry::SessionFeed;
pub use relay::{SignalingFeed, SignalingRelay};
pub use service::CallService;
