mod common;

use agentry::{
    Agent, AgentError, AgentType, Context, Handlers, HostState, NodeHost, RemoteEnvelope,
    RuntimeEnvironment,
};
use common::{eventually, test_env, WAIT};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Note {
    text: String,
}

/// Collects the notes it receives from other nodes
struct Inbox {
    out: Sender<(RemoteEnvelope, Note)>,
}

impl Agent for Inbox {
    fn handlers(handlers: &mut Handlers<Self>) -> agentry::Result<()> {
        handlers.receive(|inbox: &mut Inbox, envelope: RemoteEnvelope, _ctx: &mut Context<'_>| {
            let note: Note = envelope.body()?;
            inbox.out.send((envelope, note))?;
            Ok(())
        })?;
        Ok(())
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn inbox(env: &RuntimeEnvironment, address: &str) -> Receiver<(RemoteEnvelope, Note)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let id = env
        .spawn_agent(AgentType::new("inbox"), Inbox { out: tx }, None)
        .unwrap();
    env.bind(address, &id).unwrap();
    rx
}

fn note(destination: &str, text: &str) -> RemoteEnvelope {
    RemoteEnvelope::new(destination, "Note", &Note { text: text.to_string() }).unwrap()
}

#[test]
fn envelopes_cross_nodes_in_both_directions() {
    let env_a = test_env("node-a");
    let env_b = test_env("node-b");
    let host_a = NodeHost::new(env_a.clone(), loopback());
    let host_b = NodeHost::new(env_b.clone(), loopback());
    host_a.start().unwrap();
    let addr_b = host_b.start().unwrap();

    let inbox_a = inbox(&env_a, "agent://inbox");
    let inbox_b = inbox(&env_b, "agent://inbox");

    assert_eq!(host_a.connect(addr_b).unwrap(), "node-b");
    assert!(env_a.routes().try_find("http://node-b").is_some());
    assert!(eventually(|| env_b.routes().try_find("http://node-a").is_some()));
    assert_eq!(host_a.peers(), vec!["node-b".to_string()]);

    let to_b = env_a.channel("http://node-b").unwrap();
    let envelope = note("agent://inbox/notes", "hello b").with_response_address("agent://inbox");
    to_b.send(envelope.clone()).unwrap();

    let (received, body) = inbox_b.recv_timeout(WAIT).unwrap();
    assert_eq!(received, envelope);
    assert_eq!(body.text, "hello b");

    // Reply along the response address, through b's link to a.
    let reply_to = received.response_address.unwrap();
    env_b
        .channel("http://node-a")
        .unwrap()
        .send(note(&reply_to, "hello a"))
        .unwrap();
    let (_, body) = inbox_a.recv_timeout(WAIT).unwrap();
    assert_eq!(body.text, "hello a");

    host_a.stop();
    host_b.stop();
    env_a.shutdown();
    env_b.shutdown();
}

#[test]
fn unroutable_envelopes_are_dropped() {
    let env_a = test_env("sender");
    let env_b = test_env("receiver");
    let host_a = NodeHost::new(env_a.clone(), loopback());
    let host_b = NodeHost::new(env_b.clone(), loopback());
    let addr_b = host_b.start().unwrap();
    let inbox_b = inbox(&env_b, "agent://inbox");

    host_a.connect(addr_b).unwrap();
    let to_b = env_a.channel("http://receiver").unwrap();
    to_b.send(note("agent://nobody", "lost")).unwrap();
    to_b.send(note("agent://inbox", "found")).unwrap();

    // The miss does not disturb the connection or later deliveries.
    let (_, body) = inbox_b.recv_timeout(WAIT).unwrap();
    assert_eq!(body.text, "found");
    assert_eq!(host_a.peers(), vec!["receiver".to_string()]);

    host_a.stop();
    host_b.stop();
    env_a.shutdown();
    env_b.shutdown();
}

#[test]
fn disconnect_removes_peer_route() {
    let env_a = test_env("dialer");
    let env_b = test_env("listener");
    let host_a = NodeHost::new(env_a.clone(), loopback());
    let host_b = NodeHost::new(env_b.clone(), loopback());
    let addr_b = host_b.start().unwrap();

    host_a.connect(addr_b).unwrap();
    assert!(eventually(|| env_b.routes().try_find("http://dialer").is_some()));

    host_b.stop();
    assert_eq!(host_b.state(), HostState::Disposed);
    assert!(env_b.routes().try_find("http://dialer").is_none());
    assert!(eventually(|| env_a.routes().try_find("http://listener").is_none()));
    assert!(eventually(|| host_a.peers().is_empty()));
    assert_eq!(
        env_a.channel("http://listener").unwrap().send(note("agent://x", "late")),
        Err(AgentError::Unresolved("http://listener".to_string()))
    );

    assert_eq!(host_b.start(), Err(AgentError::Disposed));
    host_a.stop();
    env_a.shutdown();
    env_b.shutdown();
}

#[test]
fn second_connection_from_same_node_rejected() {
    let env_a = test_env("twin");
    let env_b = test_env("hub");
    let host_a = NodeHost::new(env_a.clone(), loopback());
    let host_b = NodeHost::new(env_b.clone(), loopback());
    let addr_b = host_b.start().unwrap();

    host_a.connect(addr_b).unwrap();
    assert!(matches!(
        host_a.connect(addr_b),
        Err(AgentError::DuplicateRoute(ref host)) if host == "http://hub"
    ));
    assert_eq!(host_a.peers(), vec!["hub".to_string()]);

    host_a.stop();
    host_b.stop();
    env_a.shutdown();
    env_b.shutdown();
}
