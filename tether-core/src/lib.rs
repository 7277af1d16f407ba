//! Tether Core - Shared Types
//!
//! Identity, documents, field descriptors, request kinds and the collaborator
//! traits the synchronization engine is written against. This crate performs
//! no I/O.

mod config;
mod descriptor;
mod document;
mod error;
mod identity;
mod position;
mod request;
mod transport;

pub use config::*;
pub use descriptor::*;
pub use document::*;
pub use error::*;
pub use identity::*;
pub use position::*;
pub use request::*;
pub use transport::*;
