//! Fuzz target for the sync engine under link and storage faults
//!
//! # Strategy
//!
//! - Random sends, incoming messages and typing events
//! - Severed connections, outages and failing writes
//! - A cache failing at 0% to 90%
//!
//! # Invariants
//!
//! - The engine NEVER panics
//! - The local view passes every standard invariant after each operation
//! - The server stores one copy per acknowledged send

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_harness::{InvariantRegistry, SIM_ENDPOINT, SimWorld, typing_frame};
use parley_proto::MessageStatus;
use parley_sync::{EngineConfig, MemoryStore, store::ChaoticStore};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for the link and clock
    seed: u64,
    /// Seed for ChaoticStore RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    Send { conversation: u8 },
    Incoming { conversation: u8 },
    Typing { is_typing: bool },
    RetryFailed,
    Sever,
    Outage { down: bool },
    FlakyWrites { flaky: bool },
    Idle { secs: u8 },
}

fn conversation_id(index: u8) -> String {
    format!("c{}", index % 3)
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let store = ChaoticStore::with_seed(MemoryStore::new(), failure_rate, scenario.chaos_seed);
    let mut world = SimWorld::with_store(scenario.seed, store, EngineConfig::new(SIM_ENDPOINT));
    let registry = InvariantRegistry::standard();

    world.connect("token").unwrap();
    world.join("c0").unwrap();

    let mut sent: Vec<(String, String)> = Vec::new();
    let mut incoming = 0usize;
    for operation in scenario.operations.iter().take(64) {
        match operation {
            ChaosOperation::Send { conversation } => {
                let conversation_id = conversation_id(*conversation);
                let temp_id = world.send_text(&conversation_id, "fuzz").unwrap();
                sent.push((conversation_id, temp_id));
            }
            ChaosOperation::Incoming { conversation } => {
                let frame = world.server.post_from("bob", &conversation_id(*conversation), "hello");
                world.deliver(frame);
                incoming += 1;
            }
            ChaosOperation::Typing { is_typing } => world.deliver(typing_frame("bob", "c0", *is_typing)),
            ChaosOperation::RetryFailed => {
                let failed = sent.iter().find(|(conversation_id, temp_id)| {
                    world
                        .engine
                        .messages(conversation_id)
                        .iter()
                        .any(|m| &m.id == temp_id && m.status == MessageStatus::Failed)
                });
                if let Some((conversation_id, temp_id)) = failed.cloned() {
                    world.retry(&conversation_id, &temp_id).unwrap();
                }
            }
            ChaosOperation::Sever => world.sever(),
            ChaosOperation::Outage { down } => {
                world.transport.set_reachable(!down);
                world.run_until_idle();
            }
            ChaosOperation::FlakyWrites { flaky } => {
                world.transport.set_send_failure_rate(if *flaky { 0.5 } else { 0.0 });
            }
            ChaosOperation::Idle { secs } => world.run_for(Duration::from_secs(u64::from(*secs))),
        }

        if let Err(violations) = world.check(&registry) {
            panic!("invariant violation after {operation:?}: {violations:?}");
        }
    }

    let stored: usize = (0..3u8).map(|index| world.server.stored(&conversation_id(index)).len()).sum();
    assert_eq!(stored, world.server.acknowledged().len() + incoming, "server stored a send twice");
});
