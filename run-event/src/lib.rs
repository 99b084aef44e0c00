//! Run event protocol: type + payload + envelope.
//!
//! This crate defines the wire shape of a single run event and envelope injection.
//! It does not depend on foundry. The runtime bridges its trace/tool events into
//! `RunEvent` and calls `to_json`; channel adapters forward the frames.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::RunEvent;
