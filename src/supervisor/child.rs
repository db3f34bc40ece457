//! Child specifications

use crate::agent::{AgentArgs, AgentId};
use crate::error::{AgentError, Result};
use crate::runtime::RuntimeEnvironment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Grace period used when a specification does not set one
pub const DEFAULT_SHUTDOWN: Duration = Duration::from_millis(5000);

/// Startup factory: `(environment, supervisor id, agent type, args) -> child id`
///
/// The child must be spawned with the supervisor as its parent, otherwise the
/// supervisor never hears about its termination.
pub type StartFn =
    Arc<dyn Fn(&RuntimeEnvironment, &AgentId, &str, &AgentArgs) -> Result<AgentId> + Send + Sync>;

/// When a terminated child is restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Always restarted
    Permanent,
    /// Never restarted
    Temporary,
    /// Restarted only after an abnormal exit
    Transient,
}

/// How long to wait for a child to stop cleanly before killing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Wait as long as it takes (`-1`)
    Infinity,
    /// Kill without asking (`0`)
    Immediate,
    /// Wait up to this long, then kill (`> 0` ms)
    Timeout(Duration),
}

impl Shutdown {
    /// Decode the millisecond convention: `-1` infinity, `0` immediate,
    /// positive values a timeout.
    pub fn from_millis(ms: i64) -> Result<Self> {
        match ms {
            -1 => Ok(Shutdown::Infinity),
            0 => Ok(Shutdown::Immediate),
            ms if ms > 0 => Ok(Shutdown::Timeout(Duration::from_millis(ms as u64))),
            ms => Err(AgentError::InvalidShutdown(ms)),
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            Shutdown::Infinity => -1,
            Shutdown::Immediate => 0,
            Shutdown::Timeout(d) => d.as_millis().try_into().unwrap_or(i64::MAX),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::Timeout(DEFAULT_SHUTDOWN)
    }
}

/// Declarative description of a supervised child
#[derive(Clone)]
pub struct ChildSpecification {
    /// Shared by clones; tells a resubmitted specification from a new one
    identity: Uuid,
    name: String,
    start: StartFn,
    restart: RestartMode,
    shutdown: Shutdown,
    agent_type: String,
    args: AgentArgs,
    address: Option<String>,
    pub(crate) terminate: bool,
}

impl ChildSpecification {
    /// A permanent child spawned by type name under the supervisor
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>, args: AgentArgs) -> Self {
        let start: StartFn = Arc::new(spawn_under_supervisor);
        ChildSpecification {
            identity: Uuid::new_v4(),
            name: name.into(),
            start,
            restart: RestartMode::Permanent,
            shutdown: Shutdown::default(),
            agent_type: agent_type.into(),
            args,
            address: None,
            terminate: false,
        }
    }

    pub fn with_restart(mut self, restart: RestartMode) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Replace the startup factory
    pub fn with_start<F>(mut self, start: F) -> Self
    where
        F: Fn(&RuntimeEnvironment, &AgentId, &str, &AgentArgs) -> Result<AgentId> + Send + Sync + 'static,
    {
        self.start = Arc::new(start);
        self
    }

    /// Address the child is registered under; kept across restarts
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restart(&self) -> RestartMode {
        self.restart
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn args(&self) -> &AgentArgs {
        &self.args
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// True once the specification has been deleted from its supervisor
    pub fn is_terminated(&self) -> bool {
        self.terminate
    }

    pub(crate) fn start(&self, env: &RuntimeEnvironment, supervisor: &AgentId) -> Result<AgentId> {
        (self.start)(env, supervisor, &self.agent_type, &self.args)
    }

    pub(crate) fn same_specification(&self, other: &ChildSpecification) -> bool {
        self.identity == other.identity
    }
}

impl std::fmt::Debug for ChildSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpecification")
            .field("name", &self.name)
            .field("agent_type", &self.agent_type)
            .field("restart", &self.restart)
            .field("shutdown", &self.shutdown)
            .field("address", &self.address)
            .field("terminate", &self.terminate)
            .finish()
    }
}

fn spawn_under_supervisor(
    env: &RuntimeEnvironment,
    supervisor: &AgentId,
    agent_type: &str,
    args: &AgentArgs,
) -> Result<AgentId> {
    env.spawn(agent_type, args, Some(supervisor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shutdown_millis_convention() {
        assert_eq!(Shutdown::from_millis(-1).unwrap(), Shutdown::Infinity);
        assert_eq!(Shutdown::from_millis(0).unwrap(), Shutdown::Immediate);
        assert_eq!(
            Shutdown::from_millis(250).unwrap(),
            Shutdown::Timeout(Duration::from_millis(250))
        );
        assert_eq!(Shutdown::from_millis(-5), Err(AgentError::InvalidShutdown(-5)));
        assert_eq!(Shutdown::from_millis(250).unwrap().as_millis(), 250);
        assert_eq!(Shutdown::Infinity.as_millis(), -1);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = ChildSpecification::new("worker", "echo", json!({"n": 1}));
        assert_eq!(spec.name(), "worker");
        assert_eq!(spec.agent_type(), "echo");
        assert_eq!(spec.restart(), RestartMode::Permanent);
        assert_eq!(spec.shutdown(), Shutdown::Timeout(DEFAULT_SHUTDOWN));
        assert_eq!(spec.args()["n"], 1);
        assert!(spec.address().is_none());
        assert!(!spec.is_terminated());
    }

    #[test]
    fn test_clone_keeps_identity() {
        let spec = ChildSpecification::new("worker", "echo", json!(null));
        let clone = spec.clone().with_restart(RestartMode::Transient);
        let fresh = ChildSpecification::new("worker", "echo", json!(null));
        assert!(spec.same_specification(&clone));
        assert!(!spec.same_specification(&fresh));
    }

    #[test]
    fn test_restart_mode_serde() {
        let mode: RestartMode = serde_json::from_value(json!("transient")).unwrap();
        assert_eq!(mode, RestartMode::Transient);
    }
}
