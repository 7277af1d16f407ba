//! Tether Events - Entity Lifecycle Event Channel
//!
//! Contexts publish [`EntityEvent::Updated`] after a merge changed fields and
//! [`EntityEvent::Deleted`] after a successful delete. Consumers either
//! register synchronous handlers filtered by kind and event type, or take a
//! broadcast stream.
//!
//! Handlers run after the publishing context finished its transition. A
//! handler that errors or panics is logged and skipped; the remaining
//! handlers still run and the publisher is never affected.

mod channel;
mod event;

pub use channel::{EventChannel, EventHandler, Subscription};
pub use event::{EntityEvent, EventFilter, EventType};
