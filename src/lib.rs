//! agentry: actor runtime with supervision trees and networked addressing
//!
//! Agents are isolated units of state that exchange typed messages through
//! references. Supervisors watch groups of agents and restart them when they
//! fail, escalating when failures come too fast.
//!
//! # Architecture
//!
//! - **Agents**: state plus a handler table keyed by message type, built
//!   once at spawn
//! - **Ports**: per-agent FIFO mailboxes drained by a shared worker pool,
//!   one message at a time per agent
//! - **References**: [`LocalRef`] to a known agent, [`NamedChannel`] to
//!   whatever agent owns an address, [`SupervisorRef`] for child management
//! - **Routing**: [`HostRoutingTable`] maps `<scheme>://<host>` addresses to
//!   local agents, including peer links to other nodes
//! - **Supervision**: [`Supervisor`] applies restart modes, a restart
//!   strategy and a restart budget to its children
//! - **Networking**: [`NodeHost`] carries [`RemoteEnvelope`]s between nodes
//!   as length-prefixed frames
//!
//! # Usage
//!
//! ```rust,ignore
//! use agentry::{Agent, AgentType, Context, Handlers, RuntimeEnvironment};
//!
//! struct Counter(u64);
//!
//! impl Agent for Counter {
//!     fn handlers(handlers: &mut Handlers<Self>) -> agentry::Result<()> {
//!         handlers.receive(|c: &mut Counter, n: u64, _ctx: &mut Context<'_>| {
//!             c.0 += n;
//!             Ok(())
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! let env = RuntimeEnvironment::with_defaults()?;
//! env.register_type(AgentType::new("counter"), |_args| Ok(Counter(0)))?;
//! let id = env.spawn("counter", &serde_json::Value::Null, None)?;
//! env.local_ref(&id).unwrap().send(5u64)?;
//! ```

pub mod agent;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod net;
mod port;
pub mod reference;
pub mod routing;
pub mod runtime;
mod scheduler;
pub mod supervisor;

// Re-exports
pub use agent::{Agent, AgentArgs, AgentId, AgentType, Capability, ChildExited, Exit};
pub use codec::RemoteEnvelope;
pub use config::RuntimeConfig;
pub use context::Context;
pub use dispatch::{HandlerResult, Handlers};
pub use error::{AgentError, Result};
pub use frame::Frame;
pub use net::{HostState, NodeHost};
pub use port::PortStats;
pub use reference::{LocalRef, NamedChannel, SupervisorRef};
pub use routing::{host_address, HostRoutingTable};
pub use runtime::RuntimeEnvironment;
pub use scheduler::current_agent;
pub use supervisor::{
    ChildInfo, ChildSpecification, RestartMode, RestartStrategy, Shutdown, Supervisor,
    SupervisorRestartMode, SupervisorState, SUPERVISOR_TYPE,
};
