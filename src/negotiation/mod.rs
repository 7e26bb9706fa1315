//! Session negotiation
//!
//! Offer/answer and candidate exchange for one call at a time, plus the
//! media controls that act on the live session.

mod engine;
mod inbox;
mod media_control;
mod session;

pub use engine::{Backends, NegotiationEngine, OutgoingCall};
pub use inbox::{EarlyInbox, MAX_PENDING_CALLS};
pub use session::{NegotiationPhase, NegotiationSession, Role, SessionSnapshot};
