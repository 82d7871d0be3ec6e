// Workflow Module
//
// This module runs multi-step work across agents:
// - Task chains: ordered steps with conditional branches
// - DAG workflows: dependency-driven steps with bounded parallelism
// - Agent selection by capability and the agent-side task endpoint
// - Typed input mapping between step outputs and inputs

mod chain;
mod dag;
mod dispatch;
mod endpoint;
mod error;
mod mapping;
mod retry;
mod selector;
mod types;


pub use chain::*;
pub use dag::*;
pub use dispatch::*;
pub use endpoint::*;
pub use error::*;
pub use mapping::*;
pub use retry::*;
pub use selector::*;
pub use types::*;
