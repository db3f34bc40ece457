//! References and channels
//!
//! Capability handles for sending messages to agents without touching their
//! state:
//!
//! - [`LocalRef`]: bound directly to one port. Every other kind reduces to it.
//! - [`NamedChannel`]: an address resolved against the routing table on every
//!   send, so a restarted agent that re-registers under the same address is
//!   picked up without rebuilding the channel.
//! - [`SupervisorRef`]: a synchronous channel to an agent whose type declares
//!   the supervisor capability.

use crate::agent::{AgentId, AgentType, Exit};
use crate::dispatch::Message;
use crate::error::{AgentError, Result};
use crate::port::{Port, PortStats, Signal};
use crate::routing::{host_address, HostRoutingTable};
use crate::supervisor::{ChildInfo, ChildSpecification, SupervisorCommand, SupervisorState};
use crossbeam_channel::Sender;
use std::any::Any;
use std::sync::{Arc, Weak};

/// Direct reference to a local agent
#[derive(Clone)]
pub struct LocalRef {
    port: Arc<Port>,
}

impl LocalRef {
    pub(crate) fn new(port: Arc<Port>) -> Self {
        LocalRef { port }
    }

    pub fn id(&self) -> &AgentId {
        self.port.id()
    }

    pub fn agent_type(&self) -> &AgentType {
        self.port.agent_type()
    }

    pub fn is_alive(&self) -> bool {
        self.port.is_alive()
    }

    /// How the agent terminated, once it has
    pub fn exit(&self) -> Option<Exit> {
        self.port.exit()
    }

    pub fn stats(&self) -> PortStats {
        self.port.stats()
    }

    /// Enqueue `message` on the agent's mailbox. Never blocks.
    pub fn send<T: Any + Send>(&self, message: T) -> Result<()> {
        self.port.enqueue(Signal::Deliver(Message::new(message)))
    }

    pub(crate) fn port(&self) -> &Arc<Port> {
        &self.port
    }
}

impl std::fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRef")
            .field("id", self.id())
            .field("type", &self.agent_type().name())
            .finish()
    }
}

/// Late-bound channel to whatever agent currently owns an address
#[derive(Clone)]
pub struct NamedChannel {
    address: String,
    routes: Weak<HostRoutingTable>,
}

impl NamedChannel {
    /// Create a channel over `address`. The address must be well formed but
    /// need not be registered yet.
    pub fn new(address: impl Into<String>, routes: &Arc<HostRoutingTable>) -> Result<Self> {
        let address = address.into();
        host_address(&address)?;
        Ok(NamedChannel {
            address,
            routes: Arc::downgrade(routes),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Resolve the address right now
    pub fn resolve(&self) -> Result<LocalRef> {
        let routes = self.routes.upgrade().ok_or(AgentError::EnvironmentClosed)?;
        routes
            .try_find(&self.address)
            .ok_or_else(|| AgentError::Unresolved(self.address.clone()))
    }

    /// Resolve and send. Fails with `Unresolved` if nothing is registered.
    pub fn send<T: Any + Send>(&self, message: T) -> Result<()> {
        self.resolve()?.send(message)
    }
}

impl std::fmt::Debug for NamedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedChannel")
            .field("address", &self.address)
            .finish()
    }
}

/// Synchronous channel to a supervisor
#[derive(Clone, Debug)]
pub struct SupervisorRef {
    target: LocalRef,
}

impl SupervisorRef {
    /// Fails with `NotSupervisor` unless the agent's declared type carries
    /// the supervisor capability.
    pub fn new(target: LocalRef) -> Result<Self> {
        if !target.agent_type().is_supervisor() {
            return Err(AgentError::NotSupervisor(target.id().clone()));
        }
        Ok(SupervisorRef { target })
    }

    /// Resource id: the supervisor's agent id
    pub fn res_id(&self) -> &AgentId {
        self.target.id()
    }

    pub fn as_local(&self) -> &LocalRef {
        &self.target
    }

    pub fn start_child(&self, spec: ChildSpecification) -> Result<AgentId> {
        self.call(|reply| SupervisorCommand::StartChild { spec, reply })?
    }

    pub fn stop_child(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call(|reply| SupervisorCommand::StopChild { name, reply })?
    }

    /// Restart a child regardless of its restart mode; returns the new id
    pub fn restart_child(&self, name: &str) -> Result<AgentId> {
        let name = name.to_string();
        self.call(|reply| SupervisorCommand::RestartChild { name, reply })?
    }

    pub fn delete_child(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call(|reply| SupervisorCommand::DeleteChild { name, reply })?
    }

    /// Current id bound to `name`; `None` while the child is not running
    pub fn child_id(&self, name: &str) -> Result<Option<AgentId>> {
        let name = name.to_string();
        self.call(|reply| SupervisorCommand::ChildId { name, reply })?
    }

    /// Every child that has not been deleted, in declaration order
    pub fn children(&self) -> Result<Vec<ChildInfo>> {
        self.call(|reply| SupervisorCommand::Children { reply })?
    }

    pub fn state(&self) -> SupervisorState {
        let from_exit = |exit: Option<Exit>| match exit {
            Some(Exit::Fault(_)) => SupervisorState::Failed,
            _ => SupervisorState::Stopped,
        };
        if !self.target.is_alive() {
            return from_exit(self.target.exit());
        }
        self.call(|reply| SupervisorCommand::State { reply })
            .unwrap_or_else(|_| from_exit(self.target.exit()))
    }

    /// Send a command and block until the supervisor answers.
    ///
    /// Must not be called from the supervisor's own handlers.
    fn call<R>(&self, command: impl FnOnce(Sender<R>) -> SupervisorCommand) -> Result<R> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.target.send(command(tx))?;
        let answer = match self.target.port().environment() {
            Some(env) => env.block_in_place(|| rx.recv()),
            None => rx.recv(),
        };
        answer.map_err(|_| AgentError::AgentTerminated(self.res_id().clone()))
    }
}
