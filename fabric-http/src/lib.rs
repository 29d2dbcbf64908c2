//! fabric-http: HTTP wire mapping for fabric-core routine calls and a
//! `Communicator` that speaks it.
//!
//! Hosting the server side is left to the embedding application; it can
//! reuse [`wire`] to parse requests and encode results.

pub mod communicator;
pub mod wire;

pub use communicator::HttpCommunicator;
pub use wire::{EnvelopeType, WireStatus};
