//! Calls: data model, lifecycle and history

mod history;
mod manager;
mod types;

pub use history::{format_duration, CallDirection, CallSummary};
pub use manager::{CallManager, CallPhase};
pub use types::{Call, CallKind, CallStatus, IncomingCall};
