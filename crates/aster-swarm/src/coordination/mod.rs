// Coordination Module
//
// This module provides distributed coordination primitives for agents:
// - Leased EXCLUSIVE/SHARED locks with blocking acquisition
// - Optimistically versioned shared state
// - Reusable rendezvous barriers
// - A request protocol so remote agents make the same calls over the bus

mod barrier;
mod error;
mod locks;
mod protocol;
mod service;
mod state;

#[cfg(test)]
mod coordination_property_tests;

pub use barrier::*;
pub use error::*;
pub use locks::*;
pub use protocol::*;
pub use service::*;
pub use state::*;
