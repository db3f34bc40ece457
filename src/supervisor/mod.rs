//! Supervisors
//!
//! A supervisor is an ordinary agent whose handlers manage a declared set of
//! children. Every decision (start, stop, restart, delete, automatic
//! recovery) runs on the supervisor's own mailbox, so two restarts of the
//! same child can never interleave.
//!
//! # States
//!
//! ```text
//!   Idle ──StartChild──► Running ──child exit──► Restarting ──► Running
//!                           │                        │
//!                           │                 budget exhausted
//!                           ▼                        ▼
//!                        Stopped                  Failed ──► fault reported to parent
//! ```
//!
//! # Escalation
//!
//! When the restart budget runs out the supervisor stops its remaining
//! children and fails its own handler. The environment reports that fault to
//! the supervisor's parent exactly like any other agent fault, so recovery
//! moves up one level per failure.

mod child;
mod strategy;

pub use child::{ChildSpecification, RestartMode, Shutdown, StartFn, DEFAULT_SHUTDOWN};
pub use strategy::{RestartStrategy, SupervisorRestartMode};

use crate::agent::{Agent, AgentArgs, AgentId, ChildExited, Exit};
use crate::context::Context;
use crate::dispatch::Handlers;
use crate::error::{AgentError, Result};
use crate::routing::host_address;
use crossbeam_channel::Sender;
use serde::Deserialize;
use std::time::{Duration, Instant};
use strategy::RestartIntensity;
use tracing::{debug, error, info, warn};

/// Type name the built-in supervisor is registered under
pub const SUPERVISOR_TYPE: &str = "supervisor";

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No running children
    Idle,
    /// One or more children started
    Running,
    /// Recovering from a child exit
    Restarting,
    /// Restart budget exhausted
    Failed,
    /// Shut down cleanly
    Stopped,
}

/// Snapshot of one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub name: String,
    /// `None` while the child is not running
    pub id: Option<AgentId>,
    pub restart: RestartMode,
}

/// Control commands, answered through the enclosed reply channel
#[derive(Debug)]
pub enum SupervisorCommand {
    StartChild {
        spec: ChildSpecification,
        reply: Sender<Result<AgentId>>,
    },
    StopChild {
        name: String,
        reply: Sender<Result<()>>,
    },
    RestartChild {
        name: String,
        reply: Sender<Result<AgentId>>,
    },
    DeleteChild {
        name: String,
        reply: Sender<Result<()>>,
    },
    ChildId {
        name: String,
        reply: Sender<Result<Option<AgentId>>>,
    },
    Children {
        reply: Sender<Result<Vec<ChildInfo>>>,
    },
    State {
        reply: Sender<SupervisorState>,
    },
}

/// Strategy as read from spawn args
#[derive(Debug, Deserialize)]
#[serde(default)]
struct SupervisorArgs {
    mode: SupervisorRestartMode,
    restarts: u32,
    interval_ms: u64,
}

impl Default for SupervisorArgs {
    fn default() -> Self {
        let strategy = RestartStrategy::default();
        SupervisorArgs {
            mode: strategy.mode,
            restarts: strategy.restarts,
            interval_ms: strategy.interval.as_millis() as u64,
        }
    }
}

struct Child {
    spec: ChildSpecification,
    id: Option<AgentId>,
}

pub struct Supervisor {
    strategy: RestartStrategy,
    intensity: RestartIntensity,
    children: Vec<Child>,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(strategy: RestartStrategy) -> Self {
        Supervisor {
            intensity: RestartIntensity::new(&strategy),
            strategy,
            children: Vec::new(),
            state: SupervisorState::Idle,
        }
    }

    /// Build from spawn args such as
    /// `{"mode": "one_for_all", "restarts": 2, "interval_ms": 1000}`.
    /// `null` selects the default strategy.
    pub fn from_args(args: &AgentArgs) -> Result<Self> {
        let parsed: SupervisorArgs = if args.is_null() {
            SupervisorArgs::default()
        } else {
            serde_json::from_value(args.clone())
                .map_err(|e| AgentError::Construction(format!("Invalid supervisor args: {}", e)))?
        };
        if parsed.interval_ms == 0 {
            return Err(AgentError::Construction(
                "Invalid supervisor args: interval_ms must be positive".to_string(),
            ));
        }
        Ok(Self::new(RestartStrategy {
            mode: parsed.mode,
            restarts: parsed.restarts,
            interval: Duration::from_millis(parsed.interval_ms),
        }))
    }

    pub fn strategy(&self) -> &RestartStrategy {
        &self.strategy
    }

    fn handle_command(&mut self, command: SupervisorCommand, ctx: &mut Context<'_>) {
        // A dropped reply receiver only means the caller gave up waiting.
        match command {
            SupervisorCommand::StartChild { spec, reply } => {
                let _ = reply.send(self.start_child(spec, ctx));
            }
            SupervisorCommand::StopChild { name, reply } => {
                let _ = reply.send(self.stop_child(&name, ctx));
            }
            SupervisorCommand::RestartChild { name, reply } => {
                let _ = reply.send(self.restart_child(&name, ctx));
            }
            SupervisorCommand::DeleteChild { name, reply } => {
                let _ = reply.send(self.delete_child(&name, ctx));
            }
            SupervisorCommand::ChildId { name, reply } => {
                let _ = reply.send(self.find(&name).map(|i| self.children[i].id.clone()));
            }
            SupervisorCommand::Children { reply } => {
                let _ = reply.send(Ok(self.children()));
            }
            SupervisorCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    fn start_child(&mut self, spec: ChildSpecification, ctx: &mut Context<'_>) -> Result<AgentId> {
        if let Some(address) = spec.address() {
            host_address(address)?;
        }

        let position = self.children.iter().position(|c| c.spec.name() == spec.name());
        match position {
            Some(i) if !self.children[i].spec.terminate => {
                Err(AgentError::DuplicateChild(spec.name().to_string()))
            }
            Some(i) if self.children[i].spec.same_specification(&spec) => {
                Err(AgentError::ChildDeleted(spec.name().to_string()))
            }
            Some(i) => {
                // A fresh specification takes the deleted one's place.
                let previous = std::mem::replace(&mut self.children[i], Child { spec, id: None });
                self.launch(i, ctx).inspect_err(|_| {
                    self.children[i] = previous;
                })
            }
            None => {
                self.children.push(Child { spec, id: None });
                let i = self.children.len() - 1;
                self.launch(i, ctx).inspect_err(|_| {
                    self.children.pop();
                })
            }
        }
    }

    fn stop_child(&mut self, name: &str, ctx: &mut Context<'_>) -> Result<()> {
        let i = self.find(name)?;
        self.terminate_child(i, ctx);
        self.refresh_state();
        Ok(())
    }

    fn restart_child(&mut self, name: &str, ctx: &mut Context<'_>) -> Result<AgentId> {
        let i = self.find(name)?;
        self.terminate_child(i, ctx);
        let result = self.launch(i, ctx);
        self.refresh_state();
        result
    }

    fn delete_child(&mut self, name: &str, ctx: &mut Context<'_>) -> Result<()> {
        let i = self.find(name)?;
        self.terminate_child(i, ctx);
        self.children[i].spec.terminate = true;
        info!("Supervisor {} deleted child {}", ctx.id(), name);
        self.refresh_state();
        Ok(())
    }

    fn children(&self) -> Vec<ChildInfo> {
        self.children
            .iter()
            .filter(|c| !c.spec.terminate)
            .map(|c| ChildInfo {
                name: c.spec.name().to_string(),
                id: c.id.clone(),
                restart: c.spec.restart(),
            })
            .collect()
    }

    /// Index of a child that has not been deleted
    fn find(&self, name: &str) -> Result<usize> {
        self.children
            .iter()
            .position(|c| c.spec.name() == name && !c.spec.terminate)
            .ok_or_else(|| AgentError::ChildNotFound(name.to_string()))
    }

    /// Start child `i` through its factory and bind its address.
    fn launch(&mut self, i: usize, ctx: &mut Context<'_>) -> Result<AgentId> {
        let child = &mut self.children[i];
        let id = child
            .spec
            .start(ctx.env(), ctx.id())
            .map_err(|e| AgentError::StartFailed {
                name: child.spec.name().to_string(),
                reason: e.to_string(),
            })?;

        if let Some(address) = child.spec.address() {
            if let Err(e) = ctx.env().bind(address, &id) {
                let _ = ctx.env().kill(&id);
                return Err(AgentError::StartFailed {
                    name: child.spec.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        info!("Supervisor {} started child {} as {}", ctx.id(), child.spec.name(), id);
        child.id = Some(id.clone());
        self.state = SupervisorState::Running;
        Ok(id)
    }

    /// Stop child `i` if it is running, honoring its shutdown setting. The
    /// id is unbound first so the resulting exit signal is ignored.
    fn terminate_child(&mut self, i: usize, ctx: &mut Context<'_>) {
        let child = &mut self.children[i];
        let Some(id) = child.id.take() else {
            return;
        };
        debug!("Supervisor {} stopping child {} ({})", ctx.id(), child.spec.name(), id);
        if let Err(e) = ctx.env().shutdown_agent(&id, child.spec.shutdown()) {
            warn!("Failed to stop child {}: {}", id, e);
        }
    }

    /// Stop every running child, last declared first
    fn terminate_all(&mut self, ctx: &mut Context<'_>) {
        for i in (0..self.children.len()).rev() {
            self.terminate_child(i, ctx);
        }
    }

    fn refresh_state(&mut self) {
        if matches!(self.state, SupervisorState::Failed | SupervisorState::Stopped) {
            return;
        }
        self.state = if self.children.iter().any(|c| c.id.is_some()) {
            SupervisorState::Running
        } else {
            SupervisorState::Idle
        };
    }

    fn handle_exit(&mut self, exited: ChildExited, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let ChildExited { id, exit } = exited;
        let Some(i) = self.children.iter().position(|c| c.id.as_ref() == Some(&id)) else {
            debug!("Supervisor {} ignoring exit of unbound agent {}", ctx.id(), id);
            return Ok(());
        };
        self.children[i].id = None;

        let spec = &self.children[i].spec;
        let restart = match (spec.restart(), &exit) {
            (RestartMode::Temporary, _) => false,
            (RestartMode::Transient, Exit::Normal) => false,
            _ => true,
        };
        if !restart {
            info!(
                "Child {} of {} exited ({}), not restarting",
                spec.name(),
                ctx.id(),
                exit
            );
            self.refresh_state();
            return Ok(());
        }

        warn!("Child {} of {} exited ({}), restarting", spec.name(), ctx.id(), exit);
        self.state = SupervisorState::Restarting;
        let recovered = self.record_restart(ctx).and_then(|()| match self.strategy.mode {
            SupervisorRestartMode::OneForOne => self.relaunch(i, ctx),
            SupervisorRestartMode::OneForAll => self.restart_all(i, ctx),
        });

        match recovered {
            Ok(()) => {
                self.refresh_state();
                Ok(())
            }
            Err(e) => Err(self.fail(e, ctx).into()),
        }
    }

    /// Stop every running sibling, then restart the failed child and the
    /// siblings that were running, in declaration order. Temporary children
    /// stay down.
    fn restart_all(&mut self, failed: usize, ctx: &mut Context<'_>) -> Result<()> {
        let affected: Vec<usize> = (0..self.children.len())
            .filter(|&j| j == failed || self.children[j].id.is_some())
            .collect();
        self.terminate_all(ctx);
        for j in affected {
            let spec = &self.children[j].spec;
            if spec.terminate || spec.restart() == RestartMode::Temporary {
                continue;
            }
            self.relaunch(j, ctx)?;
        }
        Ok(())
    }

    /// Launch child `i`, counting each failed attempt against the budget.
    /// Gives up after `restarts + 1` failed attempts even if the window keeps
    /// sliding.
    fn relaunch(&mut self, i: usize, ctx: &mut Context<'_>) -> Result<()> {
        for _ in 0..=self.strategy.restarts {
            match self.launch(i, ctx) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("Supervisor {} could not restart child: {}", ctx.id(), e);
                    self.record_restart(ctx)?;
                }
            }
        }
        Err(AgentError::RestartIntensity(ctx.id().clone()))
    }

    fn record_restart(&mut self, ctx: &Context<'_>) -> Result<()> {
        if self.intensity.record(Instant::now()) {
            Ok(())
        } else {
            Err(AgentError::RestartIntensity(ctx.id().clone()))
        }
    }

    /// Enter `Failed`: stop the remaining children and hand back the error
    /// that faults this supervisor.
    fn fail(&mut self, cause: AgentError, ctx: &mut Context<'_>) -> AgentError {
        self.state = SupervisorState::Failed;
        error!(
            "Supervisor {} giving up after {} restarts within {:?}: {}",
            ctx.id(),
            self.strategy.restarts,
            self.strategy.interval,
            cause
        );
        self.terminate_all(ctx);
        cause
    }
}

impl Agent for Supervisor {
    fn handlers(handlers: &mut Handlers<Self>) -> Result<()> {
        handlers
            .receive(|sup: &mut Supervisor, command: SupervisorCommand, ctx: &mut Context<'_>| {
                sup.handle_command(command, ctx);
                Ok(())
            })?
            .receive(|sup: &mut Supervisor, exited: ChildExited, ctx: &mut Context<'_>| {
                sup.handle_exit(exited, ctx)
            })?;
        Ok(())
    }

    fn stopped(&mut self, ctx: &mut Context<'_>) {
        self.terminate_all(ctx);
        if self.state != SupervisorState::Failed {
            self.state = SupervisorState::Stopped;
        }
        info!("Supervisor {} stopped ({:?})", ctx.id(), self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_args() {
        let sup = Supervisor::from_args(&json!({
            "mode": "one_for_all",
            "restarts": 2,
            "interval_ms": 750
        }))
        .unwrap();
        assert_eq!(
            *sup.strategy(),
            RestartStrategy::one_for_all(2, Duration::from_millis(750))
        );
    }

    #[test]
    fn test_from_null_args_uses_default() {
        let sup = Supervisor::from_args(&AgentArgs::Null).unwrap();
        assert_eq!(*sup.strategy(), RestartStrategy::default());
        assert_eq!(sup.state, SupervisorState::Idle);
    }

    #[test]
    fn test_partial_args() {
        let sup = Supervisor::from_args(&json!({"restarts": 9})).unwrap();
        assert_eq!(sup.strategy().restarts, 9);
        assert_eq!(sup.strategy().mode, SupervisorRestartMode::OneForOne);
    }

    #[test]
    fn test_bad_args() {
        let result = Supervisor::from_args(&json!({"mode": "rest_for_one"}));
        assert!(matches!(result, Err(AgentError::Construction(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Supervisor::from_args(&json!({"restarts": 3, "interval_ms": 0}));
        assert!(matches!(result, Err(AgentError::Construction(_))));
    }
}
