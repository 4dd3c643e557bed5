//! Property tests: sends survive arbitrary link faults.
//!
//! Each case runs a random schedule of sends, severed connections, outages,
//! flaky writes and idle time, then heals the network and checks where every
//! message ended up.

use std::time::Duration;

use parley_harness::{InvariantRegistry, SimWorld};
use parley_core::queue::DEFAULT_MAX_RETRIES;
use parley_proto::{MessageStatus, model::is_temp_id};
use parley_sync::Connectivity;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send,
    Sever,
    Outage(bool),
    FlakyWrites(bool),
    Idle(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Send),
        1 => Just(Op::Sever),
        1 => any::<bool>().prop_map(Op::Outage),
        1 => any::<bool>().prop_map(Op::FlakyWrites),
        2 => (0u64..45).prop_map(Op::Idle),
    ]
}

fn apply(world: &mut SimWorld, op: &Op, sent: &mut Vec<String>) {
    match op {
        Op::Send => {
            let content = format!("message {}", sent.len());
            sent.push(world.send_text("c1", &content).unwrap());
        },
        Op::Sever => world.sever(),
        Op::Outage(down) => {
            world.transport.set_reachable(!down);
            world.run_until_idle();
        },
        Op::FlakyWrites(flaky) => world.transport.set_send_failure_rate(if *flaky { 0.5 } else { 0.0 }),
        Op::Idle(secs) => world.run_for(Duration::from_secs(*secs)),
    }
}

fn heal(world: &mut SimWorld) {
    world.transport.set_reachable(true);
    world.transport.set_send_failure_rate(0.0);
    world.ensure_connected();
    world.run_for(Duration::from_secs(120));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Sends are retransmitted within their retry budget, the server keeps
    /// one copy, and the view never holds two copies of one message.
    #[test]
    fn prop_sends_are_deduplicated(seed in any::<u64>(), ops in prop::collection::vec(op(), 1..40)) {
        let mut world = SimWorld::new(seed);
        world.connect("abc").unwrap();
        world.join("c1").unwrap();
        let registry = InvariantRegistry::standard();

        let mut sent = Vec::new();
        for op in &ops {
            apply(&mut world, op, &mut sent);
            prop_assert!(world.check(&registry).is_ok(), "after {:?}: {:?}", op, world.check(&registry));
        }

        let budget = usize::try_from(DEFAULT_MAX_RETRIES).unwrap();
        for temp_id in &sent {
            prop_assert!(world.server.sends_of(temp_id) <= budget, "{} sent past its budget", temp_id);
        }
        prop_assert!(world.server.acknowledged().len() <= sent.len());
        prop_assert_eq!(world.server.stored("c1").len(), world.server.acknowledged().len());
        prop_assert_eq!(world.engine.messages("c1").len(), sent.len());
    }

    /// Once the network heals every message is confirmed or failed after its
    /// retry budget. Nothing the server accepted is left sending.
    #[test]
    fn prop_every_send_settles_after_healing(seed in any::<u64>(), ops in prop::collection::vec(op(), 1..40)) {
        let mut world = SimWorld::new(seed);
        world.connect("abc").unwrap();
        world.join("c1").unwrap();

        let mut sent = Vec::new();
        for op in &ops {
            apply(&mut world, op, &mut sent);
        }
        heal(&mut world);

        prop_assert_eq!(world.engine.connectivity(), Connectivity::Connected);
        prop_assert!(world.engine.queue().is_empty());

        let acknowledged = world.server.acknowledged();
        let stored = world.server.stored("c1");
        for message in world.engine.messages("c1") {
            match message.status {
                MessageStatus::Sending => {
                    prop_assert!(!acknowledged.contains(&message.id), "{} acknowledged but still sending", message.id);
                    prop_assert!(world.engine.queue().contains_send(&message.id) || world.engine.in_flight().iter().any(|p| p.temp_id() == Some(message.id.as_str())));
                },
                MessageStatus::Failed => {
                    prop_assert!(is_temp_id(&message.id));
                },
                _ => {
                    prop_assert!(!is_temp_id(&message.id));
                    prop_assert!(stored.iter().any(|m| m.id == message.id));
                },
            }
        }
        prop_assert!(world.check(&InvariantRegistry::standard()).is_ok());
    }

    /// A failed message can always be retried to completion.
    #[test]
    fn prop_failed_sends_retry_cleanly(seed in any::<u64>(), count in 1usize..5) {
        let mut world = SimWorld::new(seed);
        world.connect("abc").unwrap();
        world.transport.set_send_failure_rate(1.0);

        let mut sent = Vec::new();
        for i in 0..count {
            sent.push(world.send_text("c1", &format!("doomed {i}")).unwrap());
        }
        world.run_for(Duration::from_secs(180));
        prop_assert!(world.engine.messages("c1").iter().all(|m| m.status == MessageStatus::Failed));

        heal(&mut world);
        for temp_id in &sent {
            world.retry("c1", temp_id).unwrap();
        }

        let messages = world.engine.messages("c1");
        prop_assert_eq!(messages.len(), count);
        prop_assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
        for temp_id in &sent {
            prop_assert_eq!(world.server.sends_of(temp_id), 1);
        }
    }
}
