//! Error taxonomy for the runtime
//!
//! Configuration mistakes (duplicate names, wrong reference kind, malformed
//! addresses) surface synchronously as [`AgentError`] values. Resolution
//! misses are not errors: lookups return `Option`. Agent faults never reach
//! the caller of `send`; they travel to the supervisor as an exit signal.

use crate::agent::AgentId;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Handler already registered for message type {0}")]
    DuplicateHandler(&'static str),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Agent type already registered: {0}")]
    DuplicateAgentType(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent {0} has terminated")]
    AgentTerminated(AgentId),

    #[error("Agent construction failed: {0}")]
    Construction(String),

    #[error("No route for address {0}")]
    Unresolved(String),

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Address {0} is already bound to a live agent")]
    DuplicateRoute(String),

    #[error("Agent {0} is not a supervisor")]
    NotSupervisor(AgentId),

    #[error("Child {0} already exists")]
    DuplicateChild(String),

    #[error("Child not found: {0}")]
    ChildNotFound(String),

    #[error("Child {0} was deleted; start it with a new specification")]
    ChildDeleted(String),

    #[error("Failed to start child {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Invalid shutdown timeout: {0}ms")]
    InvalidShutdown(i64),

    #[error("Supervisor {0} exceeded its restart intensity")]
    RestartIntensity(AgentId),

    #[error("Runtime environment is shut down")]
    EnvironmentClosed,

    #[error("Node host has been disposed")]
    Disposed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl AgentError {
    /// True for errors caused by a bad argument from the caller.
    pub fn is_argument(&self) -> bool {
        matches!(
            self,
            AgentError::DuplicateHandler(_)
                | AgentError::UnknownAgentType(_)
                | AgentError::DuplicateAgentType(_)
                | AgentError::Unresolved(_)
                | AgentError::MalformedAddress(_)
                | AgentError::DuplicateRoute(_)
                | AgentError::NotSupervisor(_)
                | AgentError::DuplicateChild(_)
                | AgentError::ChildNotFound(_)
                | AgentError::ChildDeleted(_)
                | AgentError::InvalidShutdown(_)
        )
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_classification() {
        assert!(AgentError::Unresolved("agent://x".into()).is_argument());
        assert!(AgentError::NotSupervisor(AgentId::from("a")).is_argument());
        assert!(!AgentError::Disposed.is_argument());
        assert!(!AgentError::Io("reset".into()).is_argument());
    }

    #[test]
    fn test_io_conversion() {
        let err: AgentError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, AgentError::Io(ref m) if m.contains("refused")));
    }
}
