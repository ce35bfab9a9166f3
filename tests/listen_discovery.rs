//! Provider discovery end to end: pattern matching, the offer race,
//! timeouts and late responses, provider loss and cross-node handover.

mod common;

use common::*;
use drift_proto::{Action, Topic, TopicKind};
use driftd::transport::MemoryMesh;
use std::time::Duration;

#[tokio::test]
async fn matching_provider_is_offered_in_listen_order() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);

    let offer = p1.expect(Action::SubscriptionForPatternFound);
    assert_eq!(offer.name, "a/.*");
    assert_eq!(offer.subscription.as_deref(), Some("a/1"));
    p2.assert_silent();
}

#[tokio::test]
async fn non_matching_patterns_are_never_offered() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    let mut bystander = TestClient::new("p3");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/[0-9]");
    listen(&hub, &bystander, Topic::Record, "b/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);
    bystander.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);

    p1.expect(Action::SubscriptionForPatternFound);
    reject(&hub, &p1, Topic::Record, "a/.*", "a/1");

    let offer = p2.expect(Action::SubscriptionForPatternFound);
    assert_eq!(offer.name, "a/[0-9]");
    accept(&hub, &p2, Topic::Record, "a/[0-9]", "a/1");

    sub.expect(Action::SubscriptionHasProvider);
    p1.assert_silent();
    bystander.assert_silent();
}

#[tokio::test]
async fn accept_promotes_provider_and_notifies_subscribers() {
    let hub = single_hub();
    let mut provider = TestClient::new("p1");
    listen(&hub, &provider, Topic::Record, "a/.*");
    provider.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    provider.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &provider, Topic::Record, "a/.*", "a/1");

    let update = sub.expect(Action::SubscriptionHasProvider);
    assert_eq!(update.data, Some(serde_json::Value::Bool(true)));
    sub.assert_silent();
    provider.assert_silent();
    assert!(hub.listeners(TopicKind::Record).has_active_provider("a/1"));

    // A subscriber arriving after promotion hears about the provider
    // right after its ack.
    let mut late_sub = TestClient::new("c2");
    subscribe(&hub, &late_sub, Topic::Record, "a/1");
    late_sub.expect(Action::Subscribe);
    late_sub.expect(Action::SubscriptionHasProvider);
    // No second race starts while the provider is active.
    provider.assert_silent();
}

#[tokio::test]
async fn reject_moves_to_the_next_candidate() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    reject(&hub, &p1, Topic::Record, "a/.*", "a/1");
    p2.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
    p1.assert_silent();
}

#[tokio::test]
async fn all_candidates_rejecting_reports_no_provider() {
    let hub = single_hub();
    let mut provider = TestClient::new("p1");
    listen(&hub, &provider, Topic::Record, "a/.*");
    provider.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    provider.expect(Action::SubscriptionForPatternFound);

    reject(&hub, &provider, Topic::Record, "a/.*", "a/1");

    let update = sub.expect(Action::SubscriptionHasNoProvider);
    assert_eq!(update.data, Some(serde_json::Value::Bool(false)));
    assert!(!hub.listeners(TopicKind::Record).has_active_provider("a/1"));
}

#[tokio::test]
async fn subscription_without_candidates_reports_no_provider_immediately() {
    let hub = single_hub();
    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    sub.expect(Action::SubscriptionHasNoProvider);
    sub.assert_silent();
}

#[tokio::test(start_paused = true)]
async fn timeout_moves_to_the_next_candidate() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let timed_out = p1.expect(Action::ListenResponseTimeout);
    assert_eq!(timed_out.subscription.as_deref(), Some("a/1"));
    p2.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
}

#[tokio::test(start_paused = true)]
async fn reject_after_expiry_does_not_advance_the_race_again() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    let mut p3 = TestClient::new("p3");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    listen(&hub, &p3, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);
    p3.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;
    p1.expect(Action::ListenResponseTimeout);
    p2.expect(Action::SubscriptionForPatternFound);

    // The expired candidate's reject is a late response; the outstanding
    // offer to p2 stands and no second offer goes out.
    reject(&hub, &p1, Topic::Record, "a/.*", "a/1");
    p3.assert_silent();

    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
    p3.assert_silent();
}

#[tokio::test(start_paused = true)]
async fn late_accept_wins_when_the_race_drains() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;
    p1.expect(Action::ListenResponseTimeout);
    p2.expect(Action::SubscriptionForPatternFound);

    // The late accept is parked, not promoted, while p2 holds the offer.
    accept(&hub, &p1, Topic::Record, "a/.*", "a/1");
    sub.assert_silent();

    reject(&hub, &p2, Topic::Record, "a/.*", "a/1");

    sub.expect(Action::SubscriptionHasProvider);
    p1.assert_silent();
    assert!(hub.listeners(TopicKind::Record).has_active_provider("a/1"));
}

#[tokio::test(start_paused = true)]
async fn current_accept_revokes_the_parked_late_accept() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;
    p1.expect(Action::ListenResponseTimeout);
    p2.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &p1, Topic::Record, "a/.*", "a/1");
    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");

    sub.expect(Action::SubscriptionHasProvider);
    sub.assert_silent();
    let revoked = p1.expect(Action::SubscriptionForPatternRemoved);
    assert_eq!(revoked.subscription.as_deref(), Some("a/1"));
    p2.assert_silent();
}

#[tokio::test(start_paused = true)]
async fn first_late_accept_wins_and_later_ones_are_revoked() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    let mut p3 = TestClient::new("p3");
    for p in [&p1, &p2, &p3] {
        listen(&hub, p, Topic::Record, "a/.*");
    }
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);
    p3.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;
    p1.expect(Action::ListenResponseTimeout);
    p2.expect(Action::SubscriptionForPatternFound);
    tokio::time::sleep(Duration::from_millis(600)).await;
    p2.expect(Action::ListenResponseTimeout);
    p3.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &p1, Topic::Record, "a/.*", "a/1");
    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");

    // The second late accept is revoked outright; the first stays parked.
    p2.expect(Action::SubscriptionForPatternRemoved);
    p1.assert_silent();

    reject(&hub, &p3, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
    p1.assert_silent();
}

#[tokio::test(start_paused = true)]
async fn late_reject_does_not_revoke_the_parked_accept() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    let mut p3 = TestClient::new("p3");
    for p in [&p1, &p2, &p3] {
        listen(&hub, p, Topic::Record, "a/.*");
    }
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);
    p3.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    tokio::time::sleep(Duration::from_millis(600)).await;
    p1.expect(Action::ListenResponseTimeout);
    p2.expect(Action::SubscriptionForPatternFound);
    tokio::time::sleep(Duration::from_millis(600)).await;
    p2.expect(Action::ListenResponseTimeout);
    p3.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &p1, Topic::Record, "a/.*", "a/1");
    reject(&hub, &p2, Topic::Record, "a/.*", "a/1");
    p1.assert_silent();

    reject(&hub, &p3, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
    p1.assert_silent();
    assert!(hub.listeners(TopicKind::Record).has_active_provider("a/1"));
}

#[tokio::test]
async fn provider_disconnect_triggers_rediscovery() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);
    accept(&hub, &p1, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);

    p1.socket.close();

    sub.expect(Action::SubscriptionHasNoProvider);
    p2.expect(Action::SubscriptionForPatternFound);
    accept(&hub, &p2, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);
}

#[tokio::test]
async fn unlisten_of_the_current_candidate_advances_the_race() {
    let hub = single_hub();
    let mut p1 = TestClient::new("p1");
    let mut p2 = TestClient::new("p2");
    listen(&hub, &p1, Topic::Record, "a/.*");
    listen(&hub, &p2, Topic::Record, "a/.*");
    p1.expect(Action::Listen);
    p2.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    p1.expect(Action::SubscriptionForPatternFound);

    unlisten(&hub, &p1, Topic::Record, "a/.*");
    p1.expect(Action::Unlisten);
    p2.expect(Action::SubscriptionForPatternFound);
}

#[tokio::test]
async fn last_unsubscribe_tears_down_the_active_provider() {
    let hub = single_hub();
    let mut provider = TestClient::new("p1");
    listen(&hub, &provider, Topic::Record, "a/.*");
    provider.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Subscribe);
    provider.expect(Action::SubscriptionForPatternFound);
    accept(&hub, &provider, Topic::Record, "a/.*", "a/1");
    sub.expect(Action::SubscriptionHasProvider);

    unsubscribe(&hub, &sub, Topic::Record, "a/1");
    sub.expect(Action::Unsubscribe);

    let removed = provider.expect(Action::SubscriptionForPatternRemoved);
    assert_eq!(removed.name, "a/.*");
    assert_eq!(removed.subscription.as_deref(), Some("a/1"));
    provider.assert_silent();
    assert!(!hub.listeners(TopicKind::Record).has_active_provider("a/1"));
}

#[tokio::test]
async fn event_subscriptions_do_not_broadcast_provider_state() {
    let hub = single_hub();
    let mut provider = TestClient::new("p1");
    listen(&hub, &provider, Topic::Event, "a/.*");
    provider.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub, &sub, Topic::Event, "a/1");
    sub.expect(Action::Subscribe);
    provider.expect(Action::SubscriptionForPatternFound);

    accept(&hub, &provider, Topic::Event, "a/.*", "a/1");
    sub.assert_silent();
    assert!(hub.listeners(TopicKind::Event).has_active_provider("a/1"));

    // The no-candidates shortcut is suppressed for events too.
    let mut other = TestClient::new("c2");
    subscribe(&hub, &other, Topic::Event, "b/1");
    other.expect(Action::Subscribe);
    other.assert_silent();
}

#[tokio::test]
async fn discovery_crosses_nodes_to_a_remote_provider() {
    let mesh = MemoryMesh::new();
    let hub_a = mesh_hub(&mesh, "a");
    let hub_b = mesh_hub(&mesh, "b");
    hub_a.start();
    hub_b.start();

    let mut provider = TestClient::new("p1");
    listen(&hub_b, &provider, Topic::Record, "rides/.*");
    provider.expect(Action::Listen);

    let mut sub = TestClient::new("c1");
    subscribe(&hub_a, &sub, Topic::Record, "rides/1");
    sub.expect(Action::Subscribe);

    // The node owning the provider runs the local stage and offers.
    let offer = provider.expect(Action::SubscriptionForPatternFound);
    assert_eq!(offer.subscription.as_deref(), Some("rides/1"));

    accept(&hub_b, &provider, Topic::Record, "rides/.*", "rides/1");

    sub.expect(Action::SubscriptionHasProvider);
    sub.assert_silent();
    assert!(hub_a.listeners(TopicKind::Record).has_active_provider("rides/1"));
    assert!(hub_b.listeners(TopicKind::Record).has_active_provider("rides/1"));

    // Losing the remote provider tells the subscriber on the other node.
    provider.socket.close();
    let notices = sub.drain();
    assert!(!notices.is_empty());
    assert!(
        notices
            .iter()
            .all(|m| m.action == Action::SubscriptionHasNoProvider)
    );
    assert!(!hub_a.listeners(TopicKind::Record).has_active_provider("rides/1"));
    assert!(!hub_b.listeners(TopicKind::Record).has_active_provider("rides/1"));
}
