//! Worker pool
//!
//! Ports that have pending signals are pushed onto a shared run queue.
//! A fixed set of worker threads pull ports off the queue and drain them.
//! Agents are not pinned: each run may land on a different worker.
//!
//! A handler that has to block on another agent (a supervisor waiting for a
//! child to exit) wraps the wait in [`Scheduler::block_in_place`], which
//! lends the pool an extra worker until the wait is over so the agent being
//! waited on can still make progress.

use crate::agent::AgentId;
use crate::port::Port;
use crate::runtime::{EnvInner, RuntimeEnvironment};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How often a borrowed worker checks whether it may retire
const RETIRE_POLL: Duration = Duration::from_millis(10);

pub(crate) enum Task {
    Run(Arc<Port>),
    Shutdown,
}

pub(crate) struct Scheduler {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    env: Weak<EnvInner>,
    size: usize,
    throughput: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(env: Weak<EnvInner>, size: usize, throughput: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Scheduler {
            tx,
            rx,
            env,
            size: size.max(1),
            throughput: throughput.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the fixed worker threads
    pub(crate) fn start(&self, node_name: &str) -> std::io::Result<()> {
        let mut workers = self.workers.lock();
        for i in 0..self.size {
            let rx = self.rx.clone();
            let env = self.env.clone();
            let throughput = self.throughput;
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", node_name, i))
                .spawn(move || worker_loop(rx, None, env, throughput))?;
            workers.push(handle);
        }
        debug!("Started {} workers for node {}", self.size, node_name);
        Ok(())
    }

    pub(crate) fn submit(&self, port: Arc<Port>) {
        // Only fails once every worker is gone, i.e. after shutdown.
        let _ = self.tx.send(Task::Run(port));
    }

    /// Run a blocking wait. On a worker thread a temporary worker covers
    /// for this one until `f` returns.
    pub(crate) fn block_in_place<R>(&self, f: impl FnOnce() -> R) -> R {
        if current_agent().is_none() {
            return f();
        }

        let retire = Arc::new(AtomicBool::new(false));
        let rx = self.rx.clone();
        let borrowed = Borrowed {
            retire: Arc::clone(&retire),
            tx: self.tx.clone(),
        };
        let env = self.env.clone();
        let throughput = self.throughput;
        let spawned = thread::Builder::new()
            .name("agent-worker-borrowed".to_string())
            .spawn(move || worker_loop(rx, Some(borrowed), env, throughput));
        if let Err(e) = spawned {
            warn!("Failed to spawn a borrowed worker: {}", e);
        }

        let out = f();
        retire.store(true, Ordering::Release);
        out
    }

    /// Ask every worker to exit without waiting for them.
    pub(crate) fn close(&self) {
        for _ in 0..self.size {
            let _ = self.tx.send(Task::Shutdown);
        }
    }

    /// Ask every worker to exit and join them (except the calling thread).
    pub(crate) fn shutdown(&self) {
        self.close();
        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

/// A temporary worker lent to the pool by `block_in_place`
struct Borrowed {
    retire: Arc<AtomicBool>,
    tx: Sender<Task>,
}

fn worker_loop(
    rx: Receiver<Task>,
    borrowed: Option<Borrowed>,
    env: Weak<EnvInner>,
    throughput: usize,
) {
    loop {
        let task = match &borrowed {
            None => match rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            },
            Some(borrowed) => {
                if borrowed.retire.load(Ordering::Acquire) {
                    break;
                }
                match rx.recv_timeout(RETIRE_POLL) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match task {
            Task::Run(port) => {
                let Some(inner) = env.upgrade() else {
                    break;
                };
                let env = RuntimeEnvironment::from_inner(inner);
                set_current_agent(port.id().clone());
                port.run(&env, throughput);
                clear_current_agent();
            }
            Task::Shutdown => {
                if let Some(borrowed) = &borrowed {
                    // Meant for a pool worker: pass it on.
                    let _ = borrowed.tx.send(Task::Shutdown);
                }
                break;
            }
        }
    }
}

// Thread-local storage for the agent a worker is currently running
thread_local! {
    static CURRENT_AGENT: std::cell::RefCell<Option<AgentId>> = const { std::cell::RefCell::new(None) };
}

/// Set the current agent ID (called when a worker starts draining a port)
fn set_current_agent(id: AgentId) {
    CURRENT_AGENT.with(|cell| {
        *cell.borrow_mut() = Some(id);
    });
}

/// ID of the agent whose handler is running on this thread, if any
pub fn current_agent() -> Option<AgentId> {
    CURRENT_AGENT.with(|cell| cell.borrow().clone())
}

/// Clear the current agent ID (called when a worker releases a port)
fn clear_current_agent() {
    CURRENT_AGENT.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_agent_thread_local() {
        let id = AgentId::new();

        assert!(current_agent().is_none());

        set_current_agent(id.clone());
        assert_eq!(current_agent().unwrap(), id);

        clear_current_agent();
        assert!(current_agent().is_none());
    }

    #[test]
    fn test_block_in_place_off_worker_runs_inline() {
        let scheduler = Scheduler::new(Weak::new(), 1, 1);
        let value = scheduler.block_in_place(|| 42);
        assert_eq!(value, 42);
    }
}
