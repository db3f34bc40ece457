//! Type-keyed message dispatch
//!
//! Every message is wrapped with its `TypeId` when it is sent. An agent's
//! handler table maps that tag to exactly one closure over the agent's state.
//! The table is built once, when the agent is spawned, and never changes.

use crate::agent::Agent;
use crate::context::Context;
use crate::error::{AgentError, Result};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

/// Result returned by message handlers
pub type HandlerResult = anyhow::Result<()>;

type Handler<A> = Box<dyn Fn(&mut A, Box<dyn Any + Send>, &mut Context<'_>) -> HandlerResult + Send>;

/// A message in flight, tagged with its runtime type
pub(crate) struct Message {
    tag: TypeId,
    type_name: &'static str,
    body: Box<dyn Any + Send>,
}

impl Message {
    pub(crate) fn new<T: Any + Send>(body: T) -> Self {
        Message {
            tag: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            body: Box::new(body),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Handler table under construction
pub struct Handlers<A> {
    table: HashMap<TypeId, (&'static str, Handler<A>)>,
}

impl<A: 'static> Handlers<A> {
    pub(crate) fn new() -> Self {
        Handlers {
            table: HashMap::new(),
        }
    }

    /// Register `handler` for messages of type `T`.
    ///
    /// Fails if a handler for `T` is already registered; the existing
    /// handler stays in place.
    pub fn receive<T, F>(&mut self, handler: F) -> Result<&mut Self>
    where
        T: Any + Send,
        F: Fn(&mut A, T, &mut Context<'_>) -> HandlerResult + Send + 'static,
    {
        let tag = TypeId::of::<T>();
        let name = type_name::<T>();
        if self.table.contains_key(&tag) {
            return Err(AgentError::DuplicateHandler(name));
        }

        let erased: Handler<A> = Box::new(
            move |agent: &mut A, body: Box<dyn Any + Send>, ctx: &mut Context<'_>| match body.downcast::<T>() {
                Ok(message) => handler(agent, *message, ctx),
                Err(_) => Err(anyhow::anyhow!("message body is not a {}", name)),
            },
        );
        self.table.insert(tag, (name, erased));
        Ok(self)
    }

    /// Whether a handler is registered for `T`
    pub fn handles<T: Any>(&self) -> bool {
        self.table.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Outcome of delivering one message
#[derive(Debug)]
pub(crate) enum Dispatch {
    Handled,
    Unhandled(&'static str),
    Failed(String),
}

/// Type-erased agent: state plus its frozen handler table
pub(crate) trait Behavior: Send {
    fn started(&mut self, ctx: &mut Context<'_>) -> Dispatch;
    fn dispatch(&mut self, message: Message, ctx: &mut Context<'_>) -> Dispatch;
    fn stopped(&mut self, ctx: &mut Context<'_>);
}

pub(crate) struct Bound<A> {
    agent: A,
    handlers: Handlers<A>,
}

impl<A: Agent> Bound<A> {
    /// Run the agent's handler registration and freeze the result.
    pub(crate) fn build(agent: A) -> Result<Box<dyn Behavior>> {
        let mut handlers = Handlers::new();
        A::handlers(&mut handlers)?;
        Ok(Box::new(Bound { agent, handlers }))
    }
}

impl<A: Agent> Behavior for Bound<A> {
    fn started(&mut self, ctx: &mut Context<'_>) -> Dispatch {
        let agent = &mut self.agent;
        guarded(|| agent.started(ctx))
    }

    fn dispatch(&mut self, message: Message, ctx: &mut Context<'_>) -> Dispatch {
        let Message { tag, type_name, body } = message;
        let Some((_, handler)) = self.handlers.table.get(&tag) else {
            return Dispatch::Unhandled(type_name);
        };
        let agent = &mut self.agent;
        guarded(|| handler(agent, body, ctx))
    }

    fn stopped(&mut self, ctx: &mut Context<'_>) {
        let agent = &mut self.agent;
        if let Dispatch::Failed(reason) = guarded(|| {
            agent.stopped(ctx);
            Ok(())
        }) {
            tracing::warn!("stopped hook of {} failed: {}", ctx.id(), reason);
        }
    }
}

/// Run a handler, turning errors and panics into a fault reason.
fn guarded(f: impl FnOnce() -> HandlerResult) -> Dispatch {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Dispatch::Handled,
        Ok(Err(e)) => Dispatch::Failed(format!("{:#}", e)),
        Err(payload) => Dispatch::Failed(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
