//! Agent ports
//!
//! A port is an agent's mailbox plus its behavior. Senders push signals onto
//! the mailbox and, if the port is idle, hand it to the scheduler. A worker
//! then drains up to `throughput` signals, one at a time, before releasing
//! the port again.
//!
//! ```text
//!  send ──► [ mailbox: FIFO of signals ] ──► worker ──► behavior.dispatch()
//!                    │                          ▲
//!                    └── scheduled flag ────────┘  (at most one worker per port)
//! ```

use crate::agent::{AgentId, AgentType, Exit};
use crate::context::Context;
use crate::dispatch::{Behavior, Dispatch, Message};
use crate::error::{AgentError, Result};
use crate::runtime::{EnvInner, RuntimeEnvironment};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Entry in a mailbox
pub(crate) enum Signal {
    /// Run the agent's `started` hook
    Start,
    /// Deliver a user message
    Deliver(Message),
    /// Stop cleanly once every earlier signal has been handled
    Stop,
}

/// FIFO queue guarded by the enqueue lock
#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Signal>,
}

/// Per-port delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Messages handed to a handler
    pub processed: u64,
    /// Messages dropped because no handler matched their type
    pub unhandled: u64,
}

pub(crate) struct Port {
    id: AgentId,
    agent_type: AgentType,
    parent: Option<AgentId>,
    env: Weak<EnvInner>,
    mailbox: Mutex<Mailbox>,
    behavior: Mutex<Option<Box<dyn Behavior>>>,
    scheduled: AtomicBool,
    alive: AtomicBool,
    exit: Mutex<Option<Exit>>,
    /// Dropped on termination; waiters observe the disconnect.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    addresses: Mutex<Vec<String>>,
    processed: AtomicU64,
    unhandled: AtomicU64,
}

impl Port {
    pub(crate) fn new(
        id: AgentId,
        agent_type: AgentType,
        parent: Option<AgentId>,
        behavior: Box<dyn Behavior>,
        env: Weak<EnvInner>,
    ) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        Port {
            id,
            agent_type,
            parent,
            env,
            mailbox: Mutex::new(Mailbox::default()),
            behavior: Mutex::new(Some(behavior)),
            scheduled: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            exit: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            addresses: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> &AgentId {
        &self.id
    }

    pub(crate) fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    pub(crate) fn parent(&self) -> Option<&AgentId> {
        self.parent.as_ref()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn exit(&self) -> Option<Exit> {
        self.exit.lock().clone()
    }

    pub(crate) fn stats(&self) -> PortStats {
        PortStats {
            processed: self.processed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn environment(&self) -> Option<RuntimeEnvironment> {
        self.env.upgrade().map(RuntimeEnvironment::from_inner)
    }

    /// Push a signal and make sure a worker will pick the port up.
    pub(crate) fn enqueue(self: &Arc<Self>, signal: Signal) -> Result<()> {
        {
            let mut mailbox = self.mailbox.lock();
            if !self.is_alive() {
                return Err(AgentError::AgentTerminated(self.id.clone()));
            }
            mailbox.queue.push_back(signal);
        }
        self.schedule();
        Ok(())
    }

    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.env.upgrade() {
            Some(env) => env.submit(Arc::clone(self)),
            None => self.scheduled.store(false, Ordering::Release),
        }
    }

    /// Drain up to `throughput` signals. Called by exactly one worker at a time.
    pub(crate) fn run(self: &Arc<Self>, env: &RuntimeEnvironment, throughput: usize) {
        let mut guard = self.behavior.lock();

        for _ in 0..throughput.max(1) {
            if !self.is_alive() {
                break;
            }
            let Some(behavior) = guard.as_mut() else {
                break;
            };
            let Some(signal) = self.mailbox.lock().queue.pop_front() else {
                break;
            };

            let mut ctx = Context::new(env, self);
            let outcome = match signal {
                Signal::Start => behavior.started(&mut ctx),
                Signal::Deliver(message) => {
                    let outcome = behavior.dispatch(message, &mut ctx);
                    match &outcome {
                        Dispatch::Handled => {
                            self.processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Dispatch::Unhandled(type_name) => {
                            self.unhandled.fetch_add(1, Ordering::Relaxed);
                            debug!("Agent {} has no handler for {}, dropped", self.id, type_name);
                        }
                        Dispatch::Failed(_) => {}
                    }
                    outcome
                }
                Signal::Stop => {
                    ctx.stop();
                    Dispatch::Handled
                }
            };

            let exit = match outcome {
                Dispatch::Failed(reason) => Some(Exit::Fault(reason)),
                _ if ctx.stop_requested() => Some(Exit::Normal),
                _ => None,
            };

            if let Some(exit) = exit {
                if self.is_alive() {
                    behavior.stopped(&mut ctx);
                }
                drop(ctx);
                guard.take();
                drop(guard);
                env.finalize(self, exit);
                return;
            }
        }

        if !self.is_alive() {
            // Killed while this worker held the behavior.
            guard.take();
        }
        drop(guard);

        self.scheduled.store(false, Ordering::Release);
        let pending = self.is_alive() && !self.mailbox.lock().queue.is_empty();
        if pending {
            self.schedule();
        }
    }

    /// Mark the port dead and drop pending signals. Returns false if it
    /// was already dead.
    pub(crate) fn mark_dead(&self, exit: Exit) -> bool {
        let pending = {
            let mut mailbox = self.mailbox.lock();
            if !self.alive.swap(false, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut mailbox.queue)
        };
        *self.exit.lock() = Some(exit);
        trace!("Agent {} dropped {} pending signals", self.id, pending.len());
        drop(pending);

        // Free the behavior now unless a worker is inside a handler; that
        // worker drops it when the handler returns.
        if let Some(mut behavior) = self.behavior.try_lock() {
            behavior.take();
        }
        true
    }

    /// Wake everyone blocked in [`Port::wait`].
    pub(crate) fn release_waiters(&self) {
        self.done_tx.lock().take();
    }

    /// Block until the port has terminated. `None` waits indefinitely.
    /// Returns false if the timeout elapsed first.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                let _ = self.done_rx.recv();
                true
            }
            Some(timeout) => matches!(
                self.done_rx.recv_timeout(timeout),
                Err(RecvTimeoutError::Disconnected)
            ),
        }
    }

    pub(crate) fn add_address(&self, address: String) {
        let mut addresses = self.addresses.lock();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    pub(crate) fn remove_address(&self, address: &str) {
        self.addresses.lock().retain(|a| a != address);
    }

    pub(crate) fn take_addresses(&self) -> Vec<String> {
        std::mem::take(&mut *self.addresses.lock())
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}
