//! Aster Swarm - multi-agent coordination substrate
//!
//! Lets independently scheduled agents cooperate on one task:
//! correlated messaging over a best-effort transport, sequential and
//! dependency-driven workflow execution, and leased locks, versioned
//! shared state and barriers.
//!
//! # Modules
//! - [`transport`]: publish/subscribe seam plus an in-memory network
//! - [`bus`]: envelope framing, correlation, deduplication, handlers
//! - [`workflow`]: task-chain and DAG executors with agent selection
//! - [`coordination`]: locks, shared state and barriers
//! - [`config`] / [`telemetry`]: YAML configuration and tracing setup

pub mod bus;
pub mod config;
pub mod coordination;
pub mod telemetry;
pub mod transport;
pub mod workflow;

pub use bus::{
    AgentMessage, DeliveryMode, MessageBus, MessageBusError, MessageBusResult, MessageType,
};
pub use config::{ConfigError, SwarmConfig};
pub use coordination::{
    CoordinationClient, CoordinationError, CoordinationResult, CoordinationService, Coordinator,
    LockType,
};
pub use transport::{InMemoryNetwork, InMemoryTransport, Transport};
pub use workflow::{
    AgentSelector, CapabilityRegistry, ChainExecutor, DagExecutor, DagWorkflow, ExecutionStatus,
    TaskChain, WorkflowError, WorkflowResult,
};
