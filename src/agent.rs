//! Agent types
//!
//! An agent consists of:
//! - Identity (AgentId), assigned by the environment at spawn time
//! - A declared type (AgentType) carrying its capability tags
//! - State (the value implementing [`Agent`])
//! - Behavior (the handler table built by [`Agent::handlers`])

use crate::context::Context;
use crate::dispatch::Handlers;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque constructor arguments handed to an agent factory.
///
/// Kept as a JSON value so child specifications can clone them and rebuild
/// the agent on every restart.
pub type AgentArgs = serde_json::Value;

/// Unique identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new random agent ID
    pub fn new() -> Self {
        AgentId(Uuid::new_v4().simple().to_string())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        AgentId(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability tags an agent type can declare at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Accepts supervisor control commands
    Supervisor,
}

/// Declared type of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentType {
    name: String,
    capabilities: Vec<Capability>,
}

impl AgentType {
    pub fn new(name: impl Into<String>) -> Self {
        AgentType {
            name: name.into(),
            capabilities: Vec::new(),
        }
    }

    /// A type declaring the supervisor capability
    pub fn supervisor(name: impl Into<String>) -> Self {
        Self::new(name).with_capability(Capability::Supervisor)
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_supervisor(&self) -> bool {
        self.has(Capability::Supervisor)
    }
}

/// Behavior of an agent.
///
/// `handlers` is called once per spawn, before the first message is
/// delivered; the resulting table is fixed for the agent's lifetime.
pub trait Agent: Send + Sized + 'static {
    /// Register one handler per message type this agent accepts.
    fn handlers(handlers: &mut Handlers<Self>) -> Result<()>;

    /// Runs on the agent's own mailbox before any other message.
    fn started(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after a clean stop or a fault. Not called when the agent is killed.
    fn stopped(&mut self, _ctx: &mut Context<'_>) {}
}

/// How an agent terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exit {
    /// Clean stop requested by the agent or its owner
    Normal,
    /// A handler returned an error or panicked
    Fault(String),
    /// Forcibly killed
    Killed,
}

impl Exit {
    pub fn is_clean(&self) -> bool {
        matches!(self, Exit::Normal)
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Normal => f.write_str("normal"),
            Exit::Fault(reason) => write!(f, "fault: {}", reason),
            Exit::Killed => f.write_str("killed"),
        }
    }
}

/// Signal delivered to a parent when one of its linked children terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExited {
    pub id: AgentId,
    pub exit: Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_creation() {
        let id1 = AgentId::new();
        let id2 = AgentId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
    }

    #[test]
    fn test_supervisor_capability() {
        let worker = AgentType::new("worker");
        let supervisor = AgentType::supervisor("supervisor");
        assert!(!worker.is_supervisor());
        assert!(supervisor.is_supervisor());
        assert_eq!(supervisor.name(), "supervisor");
    }

    #[test]
    fn test_capability_not_duplicated() {
        let ty = AgentType::supervisor("s").with_capability(Capability::Supervisor);
        assert_eq!(ty.capabilities.len(), 1);
    }

    #[test]
    fn test_exit_cleanliness() {
        assert!(Exit::Normal.is_clean());
        assert!(!Exit::Fault("boom".into()).is_clean());
        assert!(!Exit::Killed.is_clean());
        assert_eq!(Exit::Fault("boom".into()).to_string(), "fault: boom");
    }
}
