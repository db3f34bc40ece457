//! Handler context
//!
//! Passed to every handler invocation. Gives the agent access to its own
//! identity, its environment and a way to request a clean stop.

use crate::agent::{AgentArgs, AgentId, AgentType};
use crate::error::Result;
use crate::port::Port;
use crate::reference::LocalRef;
use crate::runtime::RuntimeEnvironment;
use std::sync::Arc;

pub struct Context<'a> {
    env: &'a RuntimeEnvironment,
    port: &'a Arc<Port>,
    stop_requested: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(env: &'a RuntimeEnvironment, port: &'a Arc<Port>) -> Self {
        Context {
            env,
            port,
            stop_requested: false,
        }
    }

    /// ID of the agent handling the current message
    pub fn id(&self) -> &AgentId {
        self.port.id()
    }

    pub fn agent_type(&self) -> &AgentType {
        self.port.agent_type()
    }

    /// Parent this agent is linked to, if any
    pub fn parent(&self) -> Option<&AgentId> {
        self.port.parent()
    }

    pub fn env(&self) -> &RuntimeEnvironment {
        self.env
    }

    /// Reference to this agent's own mailbox
    pub fn myself(&self) -> LocalRef {
        LocalRef::new(Arc::clone(self.port))
    }

    /// Spawn an agent linked to this one
    pub fn spawn_child(&self, type_name: &str, args: &AgentArgs) -> Result<AgentId> {
        self.env.spawn(type_name, args, Some(self.id()))
    }

    /// Stop cleanly once the current message has been handled.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}
