//! Multi-node behaviour on the simulated bus.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use swarm_node::sim::{SimCluster, SimNetwork};
use swarm_node::{Deferred, NodeId, Role, StateChange, SwarmConfig, Transport};

const STEP: u64 = 100;

fn cluster(network: SimNetwork, ids: &[NodeId]) -> SimCluster {
    let mut cluster = SimCluster::new(SwarmConfig::default(), network);
    for &id in ids {
        cluster.add_node(id);
    }
    cluster
}

fn rows(cluster: &SimCluster, id: NodeId) -> Vec<(String, String, u32, NodeId)> {
    cluster
        .node(id)
        .unwrap()
        .snapshot_all()
        .into_iter()
        .map(|e| (e.key, e.value, e.version, e.origin))
        .collect()
}

#[test]
fn converges_under_loss_duplication_and_reordering() {
    let ids = [40, 12, 77, 31, 58];
    let network = SimNetwork::new(11).with_loss(0.2).with_duplication(0.1);
    let mut cluster = cluster(network, &ids);

    // Concurrent writers on shared keys, interleaved with time passing.
    for round in 0..20u32 {
        for (i, &id) in ids.iter().enumerate() {
            let key = format!("k{}", (round as usize + i) % 4);
            let value = format!("{id}-{round}");
            cluster.node_mut(id).unwrap().set_local(&key, &value);
        }
        cluster.run_for(1_000, STEP);
    }

    // Heal the bus and let periodic syncs finish the job.
    cluster.network().set_loss(0.0);
    cluster.run_for(30_000, STEP);

    assert!(cluster.converged());
    assert_eq!(rows(&cluster, 12).len(), 4);
    assert_eq!(cluster.coordinators(), BTreeSet::from([12]));
    for node in cluster.nodes() {
        assert_eq!(node.peer_count(), ids.len() - 1);
    }
}

#[test]
fn duplicated_delivery_matches_clean_delivery() {
    let ids = [1, 2, 3];
    let writes = [(1, "a", "x"), (2, "a", "y"), (3, "b", "z"), (2, "b", "w")];

    let run = |network: SimNetwork| {
        let mut cluster = cluster(network, &ids);
        for (id, key, value) in writes {
            cluster.node_mut(id).unwrap().set_local(key, value);
        }
        cluster.run_for(12_000, STEP);
        assert!(cluster.converged());
        rows(&cluster, 1)
    };

    assert_eq!(
        run(SimNetwork::new(5)),
        run(SimNetwork::new(99).with_duplication(1.0))
    );
}

#[test]
fn concurrent_equal_versions_resolve_to_lowest_origin() {
    let mut cluster = cluster(SimNetwork::new(3), &[5, 9]);
    cluster.node_mut(9).unwrap().set_local("k", "from-9");
    cluster.node_mut(5).unwrap().set_local("k", "from-5");
    cluster.settle();

    for id in [5, 9] {
        assert_eq!(rows(&cluster, id), vec![("k".to_string(), "from-5".to_string(), 1, 5)]);
    }
}

#[test]
fn batch_reaches_peers_with_one_change_signal() {
    let mut cluster = cluster(SimNetwork::new(3), &[1, 2]);
    let signals = Arc::new(Mutex::new(Vec::new()));
    let watched = Arc::new(Mutex::new(0));

    let sink = Arc::clone(&signals);
    let node = cluster.node_mut(1).unwrap();
    node.on_local_change(move |_, keys| sink.lock().unwrap().push(keys.len()));
    let counter = Arc::clone(&watched);
    node.subscribe("*", move |_: &StateChange<'_>, _: &mut Deferred| {
        *counter.lock().unwrap() += 1;
    });

    let changed = node.set_local_batch([("a", "1"), ("b", "2")]);
    assert_eq!(changed, vec!["a", "b"]);
    cluster.settle();

    assert_eq!(*signals.lock().unwrap(), vec![2]);
    assert_eq!(*watched.lock().unwrap(), 2);
    let remote = cluster.node(2).unwrap();
    assert_eq!(remote.get("a"), Some("1"));
    assert_eq!(remote.get("b"), Some("2"));
    assert!(remote.snapshot_all().iter().all(|e| e.version == 1 && e.origin == 1));
}

#[test]
fn lowest_id_is_elected_and_replaced_on_drop() {
    let mut cluster = cluster(SimNetwork::new(8), &[9, 3, 7, 5]);
    cluster.step(STEP);
    assert_eq!(cluster.coordinators(), BTreeSet::from([3]));
    assert_eq!(cluster.node(3).unwrap().role(), Role::Coordinator);

    cluster.remove_node(3);
    assert_eq!(cluster.coordinators(), BTreeSet::from([5]));
    assert!(cluster.node(5).unwrap().is_coordinator());
    assert!(!cluster.node(7).unwrap().is_coordinator());
}

#[test]
fn silent_coordinator_is_pruned_after_timeout() {
    let mut cluster = cluster(SimNetwork::new(8), &[9, 3, 7, 5]);
    cluster.step(STEP);

    // Cut 3 off the bus without any drop signal.
    cluster.network().detach(3);
    cluster.run_for(10_000, STEP);
    assert_eq!(cluster.node(5).unwrap().coordinator(), 3);

    cluster.run_for(11_000, STEP);
    for id in [5, 7, 9] {
        let node = cluster.node(id).unwrap();
        assert_eq!(node.coordinator(), 5);
        assert_eq!(node.peer_count(), 2);
        assert!(node.snapshot_peers().iter().all(|p| p.id != 3));
    }
}

#[test]
fn late_joiner_receives_full_state_on_join() {
    let mut cluster = cluster(SimNetwork::new(2), &[1, 2]);
    cluster.node_mut(1).unwrap().set_local("a", "1");
    cluster.node_mut(2).unwrap().set_local("b", "2");
    cluster.settle();

    cluster.add_node(3);
    cluster.settle();

    let late = cluster.node(3).unwrap();
    assert_eq!(late.get("a"), Some("1"));
    assert_eq!(late.get("b"), Some("2"));
    assert!(cluster.converged());
}

#[test]
fn watcher_writes_propagate_after_next_tick() {
    let mut cluster = cluster(SimNetwork::new(4), &[1, 2]);
    cluster
        .node_mut(1)
        .unwrap()
        .subscribe("ping", |change: &StateChange<'_>, deferred: &mut Deferred| {
            deferred.set("pong", change.value);
        });

    cluster.node_mut(2).unwrap().set_local("ping", "42");
    cluster.settle();
    assert_eq!(cluster.node(1).unwrap().get("pong"), None);

    cluster.step(STEP);
    assert_eq!(cluster.node(2).unwrap().get("pong"), Some("42"));
    assert_eq!(cluster.node(2).unwrap().snapshot_all()[1].origin, 1);
}

#[test]
fn garbage_on_the_bus_is_ignored() {
    let mut cluster = cluster(SimNetwork::new(6), &[1, 2]);
    cluster.node_mut(1).unwrap().set_local("a", "1");
    cluster.settle();

    let mut rogue = cluster.network().attach(99);
    rogue.send_broadcast(b"not json".to_vec()).unwrap();
    rogue.send_broadcast(br#"{"t":2,"d":{"k":"","v":"x","ver":9}}"#.to_vec()).unwrap();
    rogue.send_broadcast(br#"{"t":42}"#.to_vec()).unwrap();
    cluster.settle();

    for id in [1, 2] {
        assert_eq!(rows(&cluster, id), vec![("a".to_string(), "1".to_string(), 1, 1)]);
        assert_eq!(cluster.node(id).unwrap().peer_count(), 1);
    }
}
