//! End-to-end scenarios over the simulated link and server.

use std::time::Duration;

use parley_core::OfflineReason;
use parley_proto::{MessageStatus, model::is_temp_id};
use parley_harness::{InvariantRegistry, SimWorld, error_frame, typing_frame};
use parley_sync::{Connectivity, SyncUpdate};

fn assert_invariants(world: &SimWorld) {
    if let Err(violations) = world.check(&InvariantRegistry::standard()) {
        let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
        assert!(violations.is_empty(), "invariant violations:\n  {}", messages.join("\n  "));
    }
}

#[test]
fn offline_send_is_flushed_and_confirmed_on_connect() {
    let mut world = SimWorld::new(7);
    // Earlier traffic elsewhere, so the next server id is srv-9
    for i in 0..8 {
        world.server.post_from("bob", "c0", &format!("old {i}"));
    }

    world.join("c1").unwrap();
    let temp_id = world.send_text("c1", "hi").unwrap();

    let pending = world.engine.messages("c1");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, temp_id);
    assert_eq!(pending[0].status, MessageStatus::Sending);
    assert_eq!(world.engine.queue().len(), 1);
    assert!(world.server.received().is_empty());

    world.connect("abc").unwrap();

    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
    assert_eq!(world.server.actions(), ["conversation:join", "message:send"]);
    assert!(world.opened_urls()[0].contains("token=abc"));

    let messages = world.engine.messages("c1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "srv-9");
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].original_content, "hi");
    assert!(world.engine.queue().is_empty());

    let first = &world.engine.conversations()[0];
    assert_eq!(first.id, "c1");
    assert_eq!(first.updated_at, messages[0].created_at);
    assert_invariants(&world);
}

#[test]
fn live_send_is_replaced_in_place() {
    let mut world = SimWorld::new(1);
    world.connect("abc").unwrap();
    world.join("c1").unwrap();
    let frame = world.server.post_from("bob", "c1", "hello");
    world.deliver(frame);

    let temp_id = world.send_text("c1", "hi back").unwrap();

    let messages = world.engine.messages("c1");
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["srv-1", "srv-2"]);
    assert_eq!(world.server.sends_of(&temp_id), 1);
    assert!(messages.iter().all(|m| !is_temp_id(&m.id)));
    assert_invariants(&world);
}

#[test]
fn incoming_message_elsewhere_counts_as_unread() {
    let mut world = SimWorld::new(2);
    world.connect("abc").unwrap();
    world.join("c1").unwrap();

    let frame = world.server.post_from("bob", "c2", "psst");
    world.deliver(frame);

    let conversations = world.engine.conversations();
    assert_eq!(conversations[0].id, "c2");
    assert_eq!(conversations[0].unread_count, 1);
    assert_eq!(world.engine.messages("c2").len(), 1);
    assert_invariants(&world);
}

#[test]
fn typing_indicator_follows_events_and_clears_on_disconnect() {
    let mut world = SimWorld::new(3);
    world.connect("abc").unwrap();
    world.join("c1").unwrap();

    world.deliver(typing_frame("bob", "c1", true));
    assert!(world.engine.typing("c1").contains("bob"));

    world.deliver(typing_frame("bob", "c1", false));
    assert!(world.engine.typing("c1").is_empty());

    world.deliver(typing_frame("bob", "c1", true));
    world.sever();
    assert!(world.engine.typing("c1").is_empty());
}

#[test]
fn reconnect_rejoins_open_conversations() {
    let mut world = SimWorld::new(4);
    world.connect("abc").unwrap();
    world.join("c1").unwrap();
    assert!(world.server.joined().contains("c1"));

    world.sever();
    assert!(matches!(world.engine.connectivity(), Connectivity::Reconnecting { attempt: 1 }));

    world.run_for(Duration::from_secs(5));
    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
    assert_eq!(world.transport.opens(), 2);
    assert!(world.server.joined().contains("c1"));
    assert_eq!(world.server.actions(), ["conversation:join", "conversation:join"]);
}

#[test]
fn send_whose_echo_was_lost_is_resent_after_reconnect() {
    let mut world = SimWorld::new(12);
    world.connect("abc").unwrap();
    world.join("c1").unwrap();

    world.server.set_echo(false);
    let temp_id = world.send_text("c1", "anyone there?").unwrap();
    assert_eq!(world.server.sends_of(&temp_id), 1);
    assert_eq!(world.engine.messages("c1")[0].status, MessageStatus::Sending);

    world.server.set_echo(true);
    world.sever();
    world.run_for(Duration::from_secs(5));

    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
    assert_eq!(world.server.sends_of(&temp_id), 2);
    assert_eq!(world.server.stored("c1").len(), 1);

    let messages = world.engine.messages("c1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, world.server.stored("c1")[0].id);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert!(world.engine.in_flight().is_empty());
    assert_invariants(&world);
}

#[test]
fn rejected_token_goes_offline_without_retrying() {
    let mut world = SimWorld::new(5);
    world.server.require_token("good");

    world.connect("bad").unwrap();
    world.run_for(Duration::from_secs(300));

    assert_eq!(world.engine.connectivity(), Connectivity::Offline(OfflineReason::AuthRejected));
    assert_eq!(world.transport.opens(), 1);

    world.connect("good").unwrap();
    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
}

#[test]
fn unauthorized_error_event_stops_the_session() {
    let mut world = SimWorld::new(6);
    world.connect("abc").unwrap();

    world.deliver(error_frame("unauthorized", "token expired"));
    world.run_for(Duration::from_secs(120));

    assert_eq!(world.engine.connectivity(), Connectivity::Offline(OfflineReason::AuthRejected));
    assert_eq!(world.transport.opens(), 1);
}

#[test]
fn other_server_errors_are_reported() {
    let mut world = SimWorld::new(8);
    world.connect("abc").unwrap();
    world.take_updates();

    world.deliver(error_frame("rate_limited", "slow down"));

    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
    assert!(world.take_updates().contains(&SyncUpdate::ServerError {
        code: "rate_limited".to_string(),
        message: "slow down".to_string(),
    }));
}

#[test]
fn unreachable_server_gives_up_after_retry_budget() {
    let mut world = SimWorld::new(9);
    world.transport.set_reachable(false);

    world.connect("abc").unwrap();
    world.run_for(Duration::from_secs(600));

    assert_eq!(world.engine.connectivity(), Connectivity::Offline(OfflineReason::RetriesExhausted));
    // One initial attempt plus eight reconnects
    assert_eq!(world.transport.opens(), 9);

    world.transport.set_reachable(true);
    world.ensure_connected();
    assert_eq!(world.engine.connectivity(), Connectivity::Connected);
}

#[test]
fn failing_writes_mark_the_message_failed_until_retried() {
    let mut world = SimWorld::new(10);
    world.connect("abc").unwrap();
    world.transport.set_send_failure_rate(1.0);

    let temp_id = world.send_text("c1", "doomed").unwrap();
    world.run_for(Duration::from_secs(120));

    let messages = world.engine.messages("c1");
    assert_eq!(messages[0].id, temp_id);
    assert_eq!(messages[0].status, MessageStatus::Failed);
    assert!(world.take_updates().contains(&SyncUpdate::SendFailed {
        conversation_id: "c1".to_string(),
        temp_id: temp_id.clone(),
    }));
    assert_eq!(world.server.sends_of(&temp_id), 0);

    world.transport.set_send_failure_rate(0.0);
    world.run_for(Duration::from_secs(60));
    world.retry("c1", &temp_id).unwrap();

    let messages = world.engine.messages("c1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(world.server.sends_of(&temp_id), 1);
    assert_invariants(&world);
}

#[test]
fn logout_fails_queued_sends() {
    let mut world = SimWorld::new(11);
    let temp_id = world.send_text("c1", "never sent").unwrap();

    world.disconnect();

    assert_eq!(world.engine.messages("c1")[0].status, MessageStatus::Failed);
    assert!(world.engine.queue().is_empty());
    assert_eq!(world.engine.connectivity(), Connectivity::Disconnected);
    assert_eq!(world.server.sends_of(&temp_id), 0);
}
