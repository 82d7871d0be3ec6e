//! Agent selection
//!
//! Executors late-bind steps to agents through [`AgentSelector`]. The
//! in-memory [`CapabilityRegistry`] is the stock implementation: agents
//! register their capabilities and selection rotates among every
//! available agent that holds all requested capabilities.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Result type alias for agent selection
pub type SelectionResult<T> = Result<T, SelectionError>;

/// Error types for agent selection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// No registered agent satisfies the request
    #[error("No eligible agent for capabilities {capabilities:?}")]
    NoEligibleAgent { capabilities: Vec<String> },
}

/// Chooses the agent that runs a step
#[async_trait]
pub trait AgentSelector: Send + Sync {
    /// Pick an agent holding every capability in `capabilities`, avoiding
    /// `exclude` (agents that already failed this step)
    async fn select_agent(
        &self,
        capabilities: &[String],
        exclude: &[String],
    ) -> SelectionResult<String>;
}

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_id: String,
    pub capabilities: HashSet<String>,
    /// Unavailable agents are never selected
    pub available: bool,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: HashSet::new(),
            available: true,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn has_all_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// In-memory capability registry with round-robin selection
#[derive(Default)]
pub struct CapabilityRegistry {
    agents: RwLock<BTreeMap<String, AgentProfile>>,
    cursor: AtomicUsize,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent
    pub fn register(&self, profile: AgentProfile) {
        self.agents
            .write()
            .insert(profile.agent_id.clone(), profile);
    }

    /// Shorthand for registering an available agent
    pub fn register_agent<I, S>(&self, agent_id: impl Into<String>, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(AgentProfile::new(agent_id).with_capabilities(capabilities));
    }

    pub fn unregister(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.write().remove(agent_id)
    }

    /// Mark an agent (un)available; returns false for unknown agents
    pub fn set_available(&self, agent_id: &str, available: bool) -> bool {
        match self.agents.write().get_mut(agent_id) {
            Some(profile) => {
                profile.available = available;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Available agents holding every capability, minus `exclude`, by id
    pub fn candidates(&self, capabilities: &[String], exclude: &[String]) -> Vec<String> {
        self.agents
            .read()
            .values()
            .filter(|p| p.available && p.has_all_capabilities(capabilities))
            .filter(|p| !exclude.contains(&p.agent_id))
            .map(|p| p.agent_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl AgentSelector for CapabilityRegistry {
    async fn select_agent(
        &self,
        capabilities: &[String],
        exclude: &[String],
    ) -> SelectionResult<String> {
        let candidates = self.candidates(capabilities, exclude);
        if candidates.is_empty() {
            return Err(SelectionError::NoEligibleAgent {
                capabilities: capabilities.to_vec(),
            });
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}
