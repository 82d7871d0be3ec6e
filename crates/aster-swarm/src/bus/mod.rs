// Agent Message Bus Module
//
// This module provides agent-to-agent messaging over a best-effort transport:
// - Wire envelope and typed task/negotiation/coordination payloads
// - Correlated request/response, broadcast and handler dispatch
// - Duplicate suppression for exactly-once delivery

mod dedup;
mod envelope;
mod message_bus;
mod payload;

#[cfg(test)]
mod message_bus_property_tests;

pub use dedup::*;
pub use envelope::*;
pub use message_bus::*;
pub use payload::*;
