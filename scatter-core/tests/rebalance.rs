mod common;

use common::*;
use scatter_core::{LocalCluster, ScatterError, ScatterEvent, ScatteredConfig, SegmentState};
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test]
async fn test_new_primary_waits_for_revocation_before_key_transfer() {
    let cluster = LocalCluster::start(test_config(), &["a", "b"]).await.unwrap();
    let segment = 7;
    let old_id = cluster.topology().primary(segment).cloned().unwrap();
    let old = cluster.node(old_id.as_str()).unwrap();
    let new = cluster.nodes().find(|node| node.id() != &old_id).cloned().unwrap();

    let key = key_in_segment(segment);
    old.put(key.clone(), bytes("before")).await.unwrap();

    let topology = cluster
        .topology()
        .clone()
        .with_primary(segment, new.id().clone())
        .with_id(5);
    let mut events = new.subscribe();

    new.install_topology(topology.clone()).unwrap();
    assert_eq!(new.manager().segment_state(segment), SegmentState::Blocked);

    let writer = new.clone();
    let write_key = key.clone();
    let write = tokio::spawn(async move { writer.put(write_key, bytes("after")).await });

    // The old primary has not installed topology 5, so it cannot confirm.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(new.manager().segment_state(segment), SegmentState::Blocked);
    assert!(!write.is_finished());

    old.install_topology(topology).unwrap();
    new.wait_for_transfer(5).await.unwrap();
    old.wait_for_transfer(5).await.unwrap();
    write.await.unwrap().unwrap();

    assert_eq!(new.manager().segment_state(segment), SegmentState::Owned);
    assert_eq!(old.manager().segment_state(segment), SegmentState::NotOwned);
    assert_eq!(new.get(key.clone()).await.unwrap(), Some(bytes("after")));

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ScatterEvent::SegmentStateChanged {
            segment: changed,
            to,
            topology_id,
            ..
        } = event
        {
            if changed == segment {
                assert_eq!(topology_id, 5);
                transitions.push(to);
            }
        }
    }
    assert_eq!(transitions[0], SegmentState::Blocked);
    assert_eq!(transitions[1], SegmentState::KeyTransfer);
    assert_eq!(transitions.last(), Some(&SegmentState::Owned));
}

#[tokio::test]
async fn test_segment_stays_blocked_while_old_primary_lags() {
    let config = ScatteredConfig {
        remote_timeout_ms: 300,
        max_command_retries: 2,
        ..test_config()
    };
    let cluster = LocalCluster::start(config, &["a", "b"]).await.unwrap();
    let segment = 7;
    let old_id = cluster.topology().primary(segment).cloned().unwrap();
    let old = cluster.node(old_id.as_str()).unwrap();
    let new = cluster.nodes().find(|node| node.id() != &old_id).cloned().unwrap();

    let key = key_in_segment(segment);
    old.put(key.clone(), bytes("before")).await.unwrap();

    let topology = cluster
        .topology()
        .clone()
        .with_primary(segment, new.id().clone())
        .with_id(5);
    new.install_topology(topology.clone()).unwrap();

    let error = new.put(key.clone(), bytes("early")).await.unwrap_err();
    assert!(matches!(error, ScatterError::SegmentBlocked(blocked) if blocked == segment));
    assert!(error.is_retriable());

    // Several confirmation rounds time out; the new primary never takes over.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(new.manager().segment_state(segment), SegmentState::Blocked);
    assert_eq!(old.manager().segment_state(segment), SegmentState::Owned);
    let error = new.get(key.clone()).await.unwrap_err();
    assert!(matches!(error, ScatterError::SegmentBlocked(_)));

    old.install_topology(topology).unwrap();
    new.wait_for_transfer(5).await.unwrap();
    old.wait_for_transfer(5).await.unwrap();

    assert_eq!(new.manager().segment_state(segment), SegmentState::Owned);
    assert_eq!(old.manager().segment_state(segment), SegmentState::NotOwned);
    assert_eq!(new.get(key.clone()).await.unwrap(), Some(bytes("before")));
    new.put(key.clone(), bytes("after")).await.unwrap();
    assert_eq!(old.get(key).await.unwrap(), Some(bytes("after")));
}

#[tokio::test]
async fn test_losing_a_segment_drops_its_pending_invalidations() {
    let mut cluster = LocalCluster::start(test_config(), &["a", "b", "c"]).await.unwrap();
    let segment = 3;
    let key = key_in_segment(segment);
    let old = primary_of(&cluster, &key);
    let other_key = (0..NUM_SEGMENTS)
        .map(key_in_segment)
        .find(|candidate| primary_of(&cluster, candidate).id() == old.id() && candidate != &key)
        .unwrap();

    old.put(key.clone(), bytes("v")).await.unwrap();
    old.put(other_key.clone(), bytes("w")).await.unwrap();
    assert_eq!(old.manager().pending_invalidations().scheduled_len(), 2);

    let new = bystander_of(&cluster, &key);
    let topology = cluster
        .topology()
        .clone()
        .with_primary(segment, new.id().clone())
        .with_id(cluster.topology().id() + 1);
    cluster.install(topology).await.unwrap();

    assert_eq!(old.manager().segment_state(segment), SegmentState::NotOwned);
    let pending = old.manager().pending_invalidations();
    assert_eq!(pending.scheduled_version(&key), None);
    assert!(pending.scheduled_version(&other_key).is_some());
    assert_eq!(new.get(key).await.unwrap(), Some(bytes("v")));
}

#[tokio::test]
async fn test_versions_stay_monotonic_across_a_rebalance() {
    let mut cluster = LocalCluster::start(test_config(), &["a", "b"]).await.unwrap();
    let key = bytes("monotonic");
    let node = cluster.node("a").unwrap();

    node.put(key.clone(), bytes("1")).await.unwrap();
    let before = primary_of(&cluster, &key).container().version_of(&key).unwrap();

    cluster.join("c").await.unwrap();
    node.put(key.clone(), bytes("2")).await.unwrap();
    let after = primary_of(&cluster, &key).container().version_of(&key).unwrap();

    assert!(after > before);
    assert_eq!(after.topology_id, cluster.topology().id());
}

#[tokio::test]
async fn test_data_survives_join() {
    let mut cluster = LocalCluster::start(test_config(), &["a", "b", "c"]).await.unwrap();
    let writer = cluster.node("a").unwrap();
    let mut expected = BTreeMap::new();
    for i in 0..64 {
        let key = bytes(&format!("join-{}", i));
        let value = bytes(&format!("value-{}", i));
        writer.put(key.clone(), value.clone()).await.unwrap();
        expected.insert(key, value);
    }
    cluster.flush_invalidations().await;

    let joined = cluster.join("d").await.unwrap();
    assert!(!cluster.topology().owned_segments(joined.id()).is_empty());
    for node in cluster.nodes() {
        let states = node.manager().states().snapshot();
        let owned = cluster.topology().owned_segments(node.id());
        for (segment, state) in states.into_iter().enumerate() {
            let expected_state = if owned.contains(&(segment as u16)) {
                SegmentState::Owned
            } else {
                SegmentState::NotOwned
            };
            assert_eq!(state, expected_state, "{} segment {}", node.id(), segment);
        }
    }

    cluster.flush_invalidations().await;
    for (key, value) in &expected {
        let copies = holders(&cluster, key);
        assert!((1..=2).contains(&copies), "{:?} has {} copies", key, copies);
        assert_eq!(joined.get(key.clone()).await.unwrap(), Some(value.clone()));
    }
}

#[tokio::test]
async fn test_data_survives_single_node_leave() {
    let mut cluster = LocalCluster::start(test_config(), &["a", "b", "c", "d"]).await.unwrap();
    let writer = cluster.node("a").unwrap();
    let mut expected = BTreeMap::new();
    for i in 0..64 {
        let key = bytes(&format!("leave-{}", i));
        let value = bytes(&format!("value-{}", i));
        writer.put(key.clone(), value.clone()).await.unwrap();
        expected.insert(key, value);
    }
    cluster.flush_invalidations().await;

    cluster.leave(&["b"]).await.unwrap();
    assert!(cluster.node("b").is_none());

    let reader = cluster.node("c").unwrap();
    for (key, value) in &expected {
        assert_eq!(reader.get(key.clone()).await.unwrap(), Some(value.clone()));
    }

    // New writes land on the reshaped topology.
    for (key, _) in expected.iter().take(8) {
        writer.put(key.clone(), bytes("rewritten")).await.unwrap();
    }
    cluster.flush_invalidations().await;
    for (key, _) in expected.iter().take(8) {
        assert_eq!(holders(&cluster, key), 2);
        assert_eq!(backup_of(&cluster, key).container().get(key).unwrap().value, Some(bytes("rewritten")));
    }
}

#[tokio::test]
async fn test_losing_two_members_at_once_degrades_their_segments() {
    let mut cluster = LocalCluster::start(test_config(), &["a", "b", "c", "d"]).await.unwrap();
    let previous = cluster.topology().clone();
    let lost = previous
        .owned_segments(&"a".into())
        .union(&previous.owned_segments(&"b".into()))
        .copied()
        .collect::<std::collections::BTreeSet<_>>();
    let kept_segment = *previous.owned_segments(&"c".into()).first().unwrap();
    let lost_segment = *lost.first().unwrap();

    cluster.leave(&["a", "b"]).await.unwrap();

    let node = cluster.node("c").unwrap();
    assert_eq!(node.manager().degraded_segments(), lost);

    let error = node.put(key_in_segment(lost_segment), bytes("v")).await.unwrap_err();
    assert!(matches!(error, ScatterError::Unavailable(segment) if segment == lost_segment));
    assert!(!error.is_retriable());
    node.put(key_in_segment(kept_segment), bytes("v")).await.unwrap();

    for node in cluster.nodes() {
        node.clear_degraded();
    }
    node.put(key_in_segment(lost_segment), bytes("v")).await.unwrap();
    assert_eq!(node.get(key_in_segment(lost_segment)).await.unwrap(), Some(bytes("v")));
}

#[tokio::test]
async fn test_preloaded_versions_push_the_first_topology_id_up() {
    let mut preload = std::collections::HashMap::new();
    preload.insert(
        "a".into(),
        vec![(bytes("restored"), bytes("v"), scatter_core::EntryVersion::new(7, 3))],
    );
    let cluster = LocalCluster::start_with_preload(test_config(), &["a", "b"], preload)
        .await
        .unwrap();

    assert_eq!(cluster.topology().id(), 8);
    let node = cluster.node("b").unwrap();
    assert_eq!(node.get(bytes("restored")).await.unwrap(), Some(bytes("v")));

    node.put(bytes("restored"), bytes("w")).await.unwrap();
    let version = primary_of(&cluster, b"restored").container().version_of(b"restored").unwrap();
    assert!(version > scatter_core::EntryVersion::new(7, 3));
}
