//! Shared helpers for scenario tests

#![allow(dead_code)]

use agentry::{
    Agent, AgentArgs, AgentId, AgentType, Context, Handlers, RuntimeConfig, RuntimeEnvironment,
    SupervisorRef,
};
use crossbeam_channel::{Receiver, Sender};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn test_env(name: &str) -> RuntimeEnvironment {
    init_tracing();
    RuntimeEnvironment::new(RuntimeConfig {
        node_name: name.to_string(),
        workers: 4,
        throughput: 8,
    })
    .unwrap()
}

/// Poll `check` until it holds or the deadline passes
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Orders understood by [`Worker`]
pub enum Order {
    /// Fail the handler
    Crash,
    /// Stop cleanly
    Quit,
    /// Block the mailbox for a while
    Hang(Duration),
    /// Reply with the worker's id
    Whoami(Sender<AgentId>),
}

/// Test agent that reports every start on `started`
pub struct Worker {
    started: Sender<AgentId>,
}

impl Agent for Worker {
    fn handlers(handlers: &mut Handlers<Self>) -> agentry::Result<()> {
        handlers.receive(|_w: &mut Worker, order: Order, ctx: &mut Context<'_>| {
            match order {
                Order::Crash => anyhow::bail!("ordered to crash"),
                Order::Quit => ctx.stop(),
                Order::Hang(duration) => std::thread::sleep(duration),
                Order::Whoami(reply) => reply.send(ctx.id().clone())?,
            }
            Ok(())
        })?;
        Ok(())
    }

    fn started(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        self.started.send(ctx.id().clone())?;
        Ok(())
    }
}

/// Register the `worker` type; the receiver sees the id of every start.
pub fn register_worker(env: &RuntimeEnvironment) -> Receiver<AgentId> {
    let (tx, rx) = crossbeam_channel::unbounded();
    env.register_type(AgentType::new("worker"), move |_args: &AgentArgs| {
        Ok(Worker { started: tx.clone() })
    })
    .unwrap();
    rx
}

pub fn order(env: &RuntimeEnvironment, id: &AgentId, order: Order) {
    env.local_ref(id).unwrap().send(order).unwrap();
}

/// Wait until `name` is bound to an id other than `old`
pub fn restarted(sup: &SupervisorRef, name: &str, old: &AgentId) -> AgentId {
    let mut current = None;
    let changed = eventually(|| {
        current = sup.child_id(name).unwrap();
        current.as_ref().is_some_and(|id| id != old)
    });
    assert!(changed, "child {} was not restarted", name);
    current.unwrap()
}
