mod common;

use agentry::{Agent, AgentError, AgentType, Context, Handlers, NamedChannel, PortStats};
use common::{eventually, test_env, WAIT};
use crossbeam_channel::Sender;
use std::thread;

struct Sink {
    out: Sender<(usize, u32)>,
}

impl Agent for Sink {
    fn handlers(handlers: &mut Handlers<Self>) -> agentry::Result<()> {
        handlers.receive(|s: &mut Sink, item: (usize, u32), _ctx: &mut Context<'_>| {
            s.out.send(item)?;
            Ok(())
        })?;
        Ok(())
    }
}

/// Doubles numbers and passes them on through a named channel
struct Doubler {
    next: NamedChannel,
}

impl Agent for Doubler {
    fn handlers(handlers: &mut Handlers<Self>) -> agentry::Result<()> {
        handlers.receive(|d: &mut Doubler, n: u32, _ctx: &mut Context<'_>| {
            d.next.send((0usize, n * 2))?;
            Ok(())
        })?;
        Ok(())
    }
}

#[test]
fn order_is_preserved_per_sender() {
    let env = test_env("senders");
    let (tx, rx) = crossbeam_channel::unbounded();
    let id = env.spawn_agent(AgentType::new("sink"), Sink { out: tx }, None).unwrap();
    let sink = env.local_ref(&id).unwrap();

    let senders: Vec<_> = (0..4usize)
        .map(|sender| {
            let sink = sink.clone();
            thread::spawn(move || {
                for seq in 0..250u32 {
                    sink.send((sender, seq)).unwrap();
                }
            })
        })
        .collect();
    for handle in senders {
        handle.join().unwrap();
    }

    let mut last = [None::<u32>; 4];
    for _ in 0..1000 {
        let (sender, seq) = rx.recv_timeout(WAIT).unwrap();
        if let Some(previous) = last[sender] {
            assert!(seq > previous, "sender {} went backwards", sender);
        }
        last[sender] = Some(seq);
    }
    assert_eq!(last, [Some(249); 4]);
    assert!(eventually(|| sink.stats().processed == 1000));
    assert_eq!(sink.stats(), PortStats { processed: 1000, unhandled: 0 });
    env.shutdown();
}

#[test]
fn channel_resolves_by_host_portion() {
    let env = test_env("paths");
    let (tx, rx) = crossbeam_channel::unbounded();
    let id = env.spawn_agent(AgentType::new("sink"), Sink { out: tx }, None).unwrap();
    env.bind("agent://orders", &id).unwrap();

    let channel = env.channel("agent://Orders/eu/42").unwrap();
    assert_eq!(channel.resolve().unwrap().id(), &id);
    channel.send((1usize, 7u32)).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, 7));
    env.shutdown();
}

#[test]
fn agents_send_through_channels() {
    let env = test_env("pipeline");
    let (tx, rx) = crossbeam_channel::unbounded();
    let sink = env.spawn_agent(AgentType::new("sink"), Sink { out: tx }, None).unwrap();
    env.bind("agent://sink", &sink).unwrap();

    let next = env.channel("agent://sink").unwrap();
    let doubler = env
        .spawn_agent(AgentType::new("doubler"), Doubler { next }, None)
        .unwrap();
    let doubler = env.local_ref(&doubler).unwrap();

    for n in 1..=3u32 {
        doubler.send(n).unwrap();
    }
    let doubled: Vec<u32> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap().1).collect();
    assert_eq!(doubled, vec![2, 4, 6]);

    // Once the sink is gone the doubler's send fails and it faults.
    env.kill(&sink).unwrap();
    doubler.send(4u32).unwrap();
    assert!(env.wait_for_exit(doubler.id(), Some(WAIT)));
    assert!(eventually(|| env.unsupervised_faults().len() == 1));
    env.shutdown();
}

#[test]
fn malformed_channel_address_rejected() {
    let env = test_env("malformed");
    assert!(matches!(env.channel("sink"), Err(AgentError::MalformedAddress(_))));
    assert!(matches!(env.channel("agent://"), Err(AgentError::MalformedAddress(_))));
    env.shutdown();
}

#[test]
fn channel_outliving_environment_reports_closed() {
    let env = test_env("gone");
    let channel = env.channel("agent://anything").unwrap();
    env.shutdown();
    drop(env);
    assert_eq!(channel.send(1u32), Err(AgentError::EnvironmentClosed));
}
