//! Integration tests for the in-process router

use ringroute::{ConnectionId, ConnectionRouter, Error, LocalRouter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

async fn connect_users(router: &LocalRouter, count: usize) -> BTreeMap<String, String> {
    let mut assignments = BTreeMap::new();
    for i in 1..=count {
        let server = router.add_user(&i.to_string()).await.unwrap().unwrap();
        assignments.insert(format!("user:{}", i), server);
    }
    assignments
}

#[tokio::test]
async fn test_adding_server_moves_only_its_share() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    router.add_server("B").await.unwrap();

    let before = connect_users(&router, 1000).await;
    let migrated: BTreeSet<String> = router.add_server("C").await.unwrap().into_iter().collect();

    // Roughly a third of the keyspace moves to the new server
    assert!(
        migrated.len() > 150 && migrated.len() < 550,
        "unexpected migration size {}",
        migrated.len()
    );

    for (connection, old) in &before {
        let id = ConnectionId::parse(connection).unwrap();
        let now = router.resolve(&id).await.unwrap();
        if migrated.contains(connection) {
            assert_eq!(now, "C", "{} migrated but did not land on C", connection);
        } else {
            assert_eq!(&now, old, "{} moved without being reported", connection);
        }
    }

    assert_eq!(router.connections_on_server("C").await, migrated);
}

#[tokio::test]
async fn test_removing_server_returns_exactly_its_connections() {
    let router = LocalRouter::new(150);
    for server in ["A", "B", "C"] {
        router.add_server(server).await.unwrap();
    }
    connect_users(&router, 500).await;

    let on_b = router.connections_on_server("B").await;
    let mut migrated = router.remove_server("B").await.unwrap();
    migrated.sort();

    assert_eq!(migrated, on_b.into_iter().collect::<Vec<_>>());
    assert!(!router.all_servers().await.contains("B"));
    assert!(router.connections_on_server("B").await.is_empty());

    for connection in &migrated {
        let id = ConnectionId::parse(connection).unwrap();
        let server = router.resolve(&id).await.unwrap();
        assert!(server == "A" || server == "C");
    }
}

#[tokio::test]
async fn test_add_then_remove_restores_assignments() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    router.add_server("B").await.unwrap();
    let before = connect_users(&router, 300).await;

    let added = router.add_server("C").await.unwrap();
    let mut removed = router.remove_server("C").await.unwrap();
    let mut added_sorted = added.clone();
    added_sorted.sort();
    removed.sort();
    assert_eq!(added_sorted, removed);

    let after = connect_users(&router, 300).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_empty_ring_routes_nowhere() {
    let router = LocalRouter::new(150);
    assert_eq!(router.add_user("1").await.unwrap(), None);
    assert_eq!(router.server_for_service("billing").await.unwrap(), None);
    assert!(router.all_connections().await.is_empty());

    router.add_server("only").await.unwrap();
    assert_eq!(router.add_user("1").await.unwrap().as_deref(), Some("only"));

    let migrated = router.remove_server("only").await.unwrap();
    assert_eq!(migrated, vec!["user:1".to_string()]);
    assert_eq!(router.server_for_user("1").await.unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_add_is_noop() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    connect_users(&router, 50).await;

    let ring_before = router.ring_snapshot().await;
    assert!(router.add_server("A").await.unwrap().is_empty());
    assert_eq!(router.ring_snapshot().await, ring_before);
    assert_eq!(ring_before.len(), 150);
}

#[tokio::test]
async fn test_remove_unknown_server() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    assert!(router.remove_server("ghost").await.unwrap().is_empty());
    assert_eq!(router.all_servers().await.len(), 1);
}

#[tokio::test]
async fn test_routing_is_deterministic_across_instances() {
    let first = LocalRouter::new(150);
    let second = LocalRouter::new(150);
    // Insertion order must not matter
    for server in ["node1", "node2", "node3"] {
        first.add_server(server).await.unwrap();
    }
    for server in ["node3", "node1", "node2"] {
        second.add_server(server).await.unwrap();
    }

    assert_eq!(first.ring_snapshot().await, second.ring_snapshot().await);
    for i in 0..200 {
        let id = i.to_string();
        assert_eq!(
            first.server_for_user(&id).await.unwrap(),
            second.server_for_user(&id).await.unwrap()
        );
    }
}

#[tokio::test]
async fn test_users_and_services_are_separate_keys() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    router.add_user("7").await.unwrap();
    router.add_service("7").await.unwrap();

    let on_a = router.connections_on_server("A").await;
    assert!(on_a.contains("user:7"));
    assert!(on_a.contains("service:7"));
    assert_eq!(on_a.len(), 2);
}

#[tokio::test]
async fn test_invalid_ids_rejected() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    assert!(matches!(
        router.add_user("").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        router.add_server("").await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_all_connections_lists_idle_servers() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    router.add_server("B").await.unwrap();

    let table = router.all_connections().await;
    assert_eq!(table.len(), 2);
    assert!(table.values().all(BTreeSet::is_empty));
}

#[tokio::test]
async fn test_drop_connection() {
    let router = LocalRouter::new(150);
    router.add_server("A").await.unwrap();
    let id = ConnectionId::user("1").unwrap();
    router.resolve(&id).await;

    assert_eq!(router.drop_connection(&id).await.as_deref(), Some("A"));
    assert_eq!(router.drop_connection(&id).await, None);
    assert!(router.connections_on_server("A").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_during_topology_change() {
    let router = Arc::new(LocalRouter::new(150));
    router.add_server("A").await.unwrap();
    router.add_server("B").await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..250 {
                let id = format!("{}-{}", worker, i);
                assert!(router.add_user(&id).await.unwrap().is_some());
            }
        }));
    }
    router.add_server("C").await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    // Every recorded connection sits on the server the final ring picks
    let table = router.all_connections().await;
    let total: usize = table.values().map(BTreeSet::len).sum();
    assert_eq!(total, 1000);
    for (server, connections) in table {
        for connection in connections {
            let id = ConnectionId::parse(&connection).unwrap();
            assert_eq!(router.resolve(&id).await.as_deref(), Some(server.as_str()));
        }
    }
}
