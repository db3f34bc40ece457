//! Runtime environment
//!
//! One environment per logical node. It owns everything agents share:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              RuntimeEnvironment               │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │ Agent 1  │  │ Agent 2  │  │ Agent 3  │     │
//! │  │ ┌──────┐ │  │ ┌──────┐ │  │ ┌──────┐ │     │
//! │  │ │ Port │ │  │ │ Port │ │  │ │ Port │ │     │
//! │  │ └──────┘ │  │ └──────┘ │  │ └──────┘ │     │
//! │  │ Handlers │  │ Handlers │  │ Handlers │     │
//! │  └──────────┘  └──────────┘  └──────────┘     │
//! │   Agent registry · Type registry · Routes     │
//! │               Worker scheduler                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Environments are plain values: several can live in one process (tests do
//! this) without sharing any state.
//!
//! # Lifecycle
//!
//! 1. `spawn` builds the agent's handler table, allocates an id, registers
//!    the port and queues its `started` hook
//! 2. Messages flow through references until the agent stops, faults or is
//!    killed
//! 3. On termination the port is deregistered, its addresses are released,
//!    its parent receives [`ChildExited`] and any linked children still
//!    alive are killed

use crate::agent::{Agent, AgentArgs, AgentId, AgentType, ChildExited, Exit};
use crate::config::RuntimeConfig;
use crate::dispatch::{Behavior, Bound, Message};
use crate::error::{AgentError, Result};
use crate::port::{Port, Signal};
use crate::reference::{LocalRef, NamedChannel, SupervisorRef};
use crate::routing::HostRoutingTable;
use crate::scheduler::Scheduler;
use crate::supervisor::{Shutdown, Supervisor, SUPERVISOR_TYPE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Factory = Arc<dyn Fn(&AgentArgs) -> Result<Box<dyn Behavior>> + Send + Sync>;

/// Registered agent type
#[derive(Clone)]
struct TypeEntry {
    agent_type: AgentType,
    factory: Factory,
}

/// Live agents of one environment
///
/// Maps AgentId → Port. Thread-safe for access from any worker.
#[derive(Default)]
pub(crate) struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Arc<Port>>>,
}

impl AgentRegistry {
    /// Allocate an id no live agent holds and register the port built for it
    fn register_new(&self, build: impl FnOnce(AgentId) -> Arc<Port>) -> Arc<Port> {
        let mut agents = self.agents.write();
        let id = loop {
            let id = AgentId::new();
            if !agents.contains_key(&id) {
                break id;
            }
        };
        let port = build(id.clone());
        agents.insert(id, Arc::clone(&port));
        port
    }

    fn get(&self, id: &AgentId) -> Option<Arc<Port>> {
        self.agents.read().get(id).cloned()
    }

    fn unregister(&self, id: &AgentId) {
        self.agents.write().remove(id);
    }

    fn children_of(&self, parent: &AgentId) -> Vec<Arc<Port>> {
        self.agents
            .read()
            .values()
            .filter(|p| p.parent() == Some(parent))
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Port>> {
        self.agents.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.agents.read().len()
    }
}

pub(crate) struct EnvInner {
    config: RuntimeConfig,
    types: RwLock<HashMap<String, TypeEntry>>,
    registry: AgentRegistry,
    routes: Arc<HostRoutingTable>,
    scheduler: Scheduler,
    unsupervised: Mutex<Vec<ChildExited>>,
    closed: AtomicBool,
}

impl EnvInner {
    pub(crate) fn submit(&self, port: Arc<Port>) {
        self.scheduler.submit(port);
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        self.scheduler.close();
    }
}

/// Handle to a runtime environment. Clones share the same environment.
#[derive(Clone)]
pub struct RuntimeEnvironment {
    inner: Arc<EnvInner>,
}

impl RuntimeEnvironment {
    /// Create an environment and start its workers
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let inner = Arc::new_cyclic(|weak| EnvInner {
            scheduler: Scheduler::new(weak.clone(), config.workers, config.throughput),
            config,
            types: RwLock::new(HashMap::new()),
            registry: AgentRegistry::default(),
            routes: Arc::new(HostRoutingTable::new()),
            unsupervised: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        inner.scheduler.start(&inner.config.node_name)?;

        let env = RuntimeEnvironment { inner };
        env.register_type(AgentType::supervisor(SUPERVISOR_TYPE), |args: &AgentArgs| {
            Ok(Supervisor::from_args(args)?)
        })?;
        info!(
            "Runtime environment {} started with {} workers",
            env.inner.config.node_name, env.inner.config.workers
        );
        Ok(env)
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    pub(crate) fn from_inner(inner: Arc<EnvInner>) -> Self {
        RuntimeEnvironment { inner }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> &Arc<HostRoutingTable> {
        &self.inner.routes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register an agent type that can be spawned by name
    pub fn register_type<A, F>(&self, agent_type: AgentType, factory: F) -> Result<()>
    where
        A: Agent,
        F: Fn(&AgentArgs) -> anyhow::Result<A> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |args: &AgentArgs| {
            let agent = factory(args).map_err(|e| AgentError::Construction(format!("{:#}", e)))?;
            Bound::build(agent)
        });

        let mut types = self.inner.types.write();
        if types.contains_key(agent_type.name()) {
            return Err(AgentError::DuplicateAgentType(agent_type.name().to_string()));
        }
        debug!("Registered agent type {}", agent_type.name());
        types.insert(
            agent_type.name().to_string(),
            TypeEntry {
                agent_type,
                factory,
            },
        );
        Ok(())
    }

    /// Spawn an agent of a registered type, optionally linked to `parent`
    pub fn spawn(&self, type_name: &str, args: &AgentArgs, parent: Option<&AgentId>) -> Result<AgentId> {
        let entry = self
            .inner
            .types
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgentType(type_name.to_string()))?;
        let behavior = (entry.factory)(args)?;
        self.spawn_behavior(entry.agent_type, behavior, parent)
    }

    /// Spawn an already constructed agent value
    pub fn spawn_agent<A: Agent>(
        &self,
        agent_type: AgentType,
        agent: A,
        parent: Option<&AgentId>,
    ) -> Result<AgentId> {
        let behavior = Bound::build(agent)?;
        self.spawn_behavior(agent_type, behavior, parent)
    }

    fn spawn_behavior(
        &self,
        agent_type: AgentType,
        behavior: Box<dyn Behavior>,
        parent: Option<&AgentId>,
    ) -> Result<AgentId> {
        if self.is_closed() {
            return Err(AgentError::EnvironmentClosed);
        }
        if let Some(parent) = parent {
            if !self.is_alive(parent) {
                return Err(AgentError::AgentNotFound(parent.clone()));
            }
        }

        let port = self.inner.registry.register_new(|id| {
            Arc::new(Port::new(
                id,
                agent_type.clone(),
                parent.cloned(),
                behavior,
                Arc::downgrade(&self.inner),
            ))
        });

        port.enqueue(Signal::Start)?;
        match parent {
            Some(parent) => info!("Spawned {} ({}) under {}", port.id(), agent_type.name(), parent),
            None => info!("Spawned {} ({})", port.id(), agent_type.name()),
        }
        Ok(port.id().clone())
    }

    pub fn local_ref(&self, id: &AgentId) -> Option<LocalRef> {
        self.inner.registry.get(id).map(LocalRef::new)
    }

    /// Channel over `address`, resolved against this environment's routes
    pub fn channel(&self, address: &str) -> Result<NamedChannel> {
        NamedChannel::new(address, &self.inner.routes)
    }

    pub fn supervisor_ref(&self, id: &AgentId) -> Result<SupervisorRef> {
        let target = self
            .local_ref(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.clone()))?;
        SupervisorRef::new(target)
    }

    /// Register `address` for agent `id`; released when the agent terminates
    pub fn bind(&self, address: &str, id: &AgentId) -> Result<()> {
        let port = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.clone()))?;
        self.inner.routes.register(address, LocalRef::new(Arc::clone(&port)))?;
        port.add_address(address.to_string());
        if !port.is_alive() {
            // Lost a race with termination; do not leave a stale route.
            self.inner.routes.remove_if(address, id);
            return Err(AgentError::AgentTerminated(id.clone()));
        }
        Ok(())
    }

    pub fn unbind(&self, address: &str) -> Option<LocalRef> {
        let removed = self.inner.routes.remove(address)?;
        removed.port().remove_address(address);
        Some(removed)
    }

    pub fn is_alive(&self, id: &AgentId) -> bool {
        self.inner.registry.get(id).is_some_and(|p| p.is_alive())
    }

    pub fn agent_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Ask an agent to stop once its pending messages are handled
    pub fn stop(&self, id: &AgentId) -> Result<()> {
        let port = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.clone()))?;
        port.enqueue(Signal::Stop)
    }

    /// Stop processing immediately and deregister the agent
    pub fn kill(&self, id: &AgentId) -> Result<()> {
        let port = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| AgentError::AgentNotFound(id.clone()))?;
        self.finalize(&port, Exit::Killed);
        Ok(())
    }

    /// Stop an agent honoring `shutdown`, killing it if the grace period
    /// runs out. An agent that is already gone is not an error.
    pub fn shutdown_agent(&self, id: &AgentId, shutdown: Shutdown) -> Result<()> {
        let Some(port) = self.inner.registry.get(id) else {
            return Ok(());
        };

        let grace = match shutdown {
            Shutdown::Immediate => {
                self.finalize(&port, Exit::Killed);
                return Ok(());
            }
            Shutdown::Infinity => None,
            Shutdown::Timeout(timeout) => Some(timeout),
        };

        if port.enqueue(Signal::Stop).is_err() {
            // Already terminating; wait for it to finish releasing.
            self.block_in_place(|| port.wait(grace));
            return Ok(());
        }
        if !self.block_in_place(|| port.wait(grace)) {
            warn!(
                "Agent {} did not stop within {:?}, killing it",
                id,
                grace.unwrap_or_default()
            );
            self.finalize(&port, Exit::Killed);
        }
        Ok(())
    }

    /// Block until `id` terminates or `timeout` elapses. True if it terminated.
    pub fn wait_for_exit(&self, id: &AgentId, timeout: Option<Duration>) -> bool {
        match self.inner.registry.get(id) {
            Some(port) => self.block_in_place(|| port.wait(timeout)),
            None => true,
        }
    }

    /// Faults of agents that had no parent to report to
    pub fn unsupervised_faults(&self) -> Vec<ChildExited> {
        self.inner.unsupervised.lock().clone()
    }

    /// Kill every agent and stop the workers
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down runtime environment {}", self.inner.config.node_name);
        for port in self.inner.registry.snapshot() {
            self.finalize(&port, Exit::Killed);
        }
        self.inner.scheduler.shutdown();
        info!("Runtime environment {} shut down", self.inner.config.node_name);
    }

    pub(crate) fn block_in_place<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.scheduler.block_in_place(f)
    }

    /// Terminate a port exactly once: deregister, release its addresses,
    /// notify the parent, kill linked children, wake waiters.
    pub(crate) fn finalize(&self, port: &Arc<Port>, exit: Exit) {
        if !port.mark_dead(exit.clone()) {
            return;
        }
        let id = port.id().clone();
        self.inner.registry.unregister(&id);
        for address in port.take_addresses() {
            self.inner.routes.remove_if(&address, &id);
        }

        match &exit {
            Exit::Normal => info!("Agent {} stopped", id),
            Exit::Fault(reason) => warn!("Agent {} failed: {}", id, reason),
            Exit::Killed => info!("Agent {} killed", id),
        }

        let notice = ChildExited {
            id: id.clone(),
            exit,
        };
        match port.parent() {
            Some(parent) => match self.inner.registry.get(parent) {
                Some(parent_port) => {
                    if parent_port.enqueue(Signal::Deliver(Message::new(notice))).is_err() {
                        debug!("Parent {} of {} is terminating", parent, id);
                    }
                }
                None => debug!("Parent {} of {} is gone", parent, id),
            },
            None => {
                if let Exit::Fault(reason) = &notice.exit {
                    error!("Unsupervised agent {} failed: {}", id, reason);
                    self.inner.unsupervised.lock().push(notice);
                }
            }
        }

        for child in self.inner.registry.children_of(&id) {
            self.finalize(&child, Exit::Killed);
        }

        port.release_waiters();
    }
}

impl std::fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnvironment")
            .field("node", &self.inner.config.node_name)
            .field("agents", &self.inner.registry.len())
            .finish()
    }
}
