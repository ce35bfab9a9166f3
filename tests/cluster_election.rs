//! Cluster membership and leader election through the hub.

mod common;

use common::*;
use drift_proto::Topic;
use std::time::Duration;

#[tokio::test]
async fn nodes_converge_on_one_leader() {
    let mesh = driftd::transport::MemoryMesh::new();
    let hubs = [
        mesh_hub(&mesh, "a"),
        mesh_hub(&mesh, "b"),
        mesh_hub(&mesh, "c"),
    ];
    for hub in &hubs {
        hub.start();
    }

    let leader = hubs[0].cluster().get_leader();
    for hub in &hubs {
        assert_eq!(hub.cluster().get_all().len(), 3);
        assert_eq!(hub.cluster().get_leader(), leader);
    }
    let self_proclaimed = hubs.iter().filter(|hub| hub.cluster().is_leader()).count();
    assert_eq!(self_proclaimed, 1);
}

#[tokio::test]
async fn shutdown_of_the_leader_promotes_another_node() {
    let mesh = driftd::transport::MemoryMesh::new();
    let hubs = [
        mesh_hub(&mesh, "a"),
        mesh_hub(&mesh, "b"),
        mesh_hub(&mesh, "c"),
    ];
    for hub in &hubs {
        hub.start();
    }

    let old_leader = hubs[0].cluster().get_leader();
    let (leaders, rest): (Vec<_>, Vec<_>) = hubs
        .iter()
        .partition(|hub| hub.cluster().server_name() == old_leader);

    leaders[0].shutdown();
    // Shutdown is idempotent.
    leaders[0].shutdown();

    let new_leader = rest[0].cluster().get_leader();
    assert_ne!(new_leader, old_leader);
    for hub in &rest {
        assert_eq!(hub.cluster().get_all().len(), 2);
        assert_eq!(hub.cluster().get_leader(), new_leader);
    }
}

#[tokio::test(start_paused = true)]
async fn silent_node_is_dropped_and_its_state_purged() {
    let mesh = driftd::transport::MemoryMesh::new();
    let hub_a = mesh_hub(&mesh, "a");
    let hub_b = mesh_hub(&mesh, "b");
    hub_a.start();
    hub_b.start();

    let client = TestClient::new("c1");
    subscribe(&hub_b, &client, Topic::Event, "news");
    assert!(hub_a.subscriptions(drift_proto::TopicKind::Event).has_name("news"));

    // b's gossip stops reaching a; a drops it after the inactivity
    // timeout and purges the names it replicated.
    mesh.leave("b");
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(hub_a.cluster().get_all(), vec!["a".to_string()]);
    assert!(hub_a.cluster().is_leader());
    assert!(!hub_a.subscriptions(drift_proto::TopicKind::Event).has_name("news"));
}
