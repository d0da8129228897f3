//! Lock service integration tests.
//!
//! Full region members (raft node, state machine, quorum manager, service)
//! wired through in-process networks, exercising replication, expiry,
//! cross-region quorum and partitions.

#[allow(dead_code)]
mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{eventually, lock_id, node_config, TestDeployment, SETTLE};
use geolock::lock::{LockService, LockStatus};
use geolock::server::build_region_node_with;

// =============================================================================
// Single Region
// =============================================================================

#[tokio::test]
async fn test_acquire_replicates_to_followers() {
    let deployment = TestDeployment::start(&["us-east"], 3).await;
    let leader = deployment.leader("us-east").await;
    let id = lock_id();

    let lock = leader.acquire_lock(&id, "worker-1", Some(10_000)).await.unwrap();
    assert_eq!(lock.fencing_token, 1);
    assert_eq!(lock.holder_region, "us-east");

    for service in deployment.region("us-east").services() {
        assert!(eventually(|| service.store().is_locked(&id)).await);
        let info = service.check_lock(&id).unwrap();
        assert_eq!(info.holder_id, "worker-1");
        assert_eq!(info.fencing_token, 1);
    }

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_follower_redirects_to_leader() {
    let deployment = TestDeployment::start(&["us-east"], 3).await;
    let leader = deployment.leader("us-east").await;
    let leader_id = leader.raft().node_id();
    let id = lock_id();

    let follower = deployment.region("us-east").followers().remove(0);
    follower
        .raft()
        .wait_for(SETTLE, |s| s.leader_id == Some(leader_id))
        .await
        .unwrap();

    let err = follower.acquire_lock(&id, "worker-1", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::NotLeader);
    assert!(err.is_retryable());
    assert!(err.message.contains(&leader_id.to_string()));
    assert!(!follower.store().is_locked(&id));

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_acquires_have_one_winner() {
    let deployment = TestDeployment::start(&["us-east"], 3).await;
    let leader = deployment.leader("us-east").await;
    let id = lock_id();

    let tasks: Vec<_> = (0..25)
        .map(|i| {
            let leader = Arc::clone(&leader);
            let id = id.clone();
            tokio::spawn(async move {
                leader.acquire_lock(&id, &format!("worker-{}", i), None).await
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert_eq!(err.status, LockStatus::AlreadyLocked),
        }
    }
    assert_eq!(winners, 1);

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_tokens_increase_across_cycles() {
    let deployment = TestDeployment::start(&["us-east"], 1).await;
    let leader = deployment.leader("us-east").await;
    let id = lock_id();

    let mut previous = 0;
    for round in 0..5 {
        let client = format!("worker-{}", round);
        let lock = leader.acquire_lock(&id, &client, None).await.unwrap();
        assert!(lock.fencing_token > previous);
        previous = lock.fencing_token;
        leader.release_lock(&id, &client, lock.fencing_token).await.unwrap();
        assert_eq!(leader.check_lock(&id).unwrap_err().status, LockStatus::NotFound);
    }

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_expired_lock_can_be_taken_over() {
    let deployment = TestDeployment::start(&["us-east"], 1).await;
    let leader = deployment.leader("us-east").await;
    let id = lock_id();

    let first = leader.acquire_lock(&id, "worker-1", Some(200)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(leader.check_lock(&id).unwrap_err().status, LockStatus::NotFound);
    let second = leader.acquire_lock(&id, "worker-2", Some(5_000)).await.unwrap();
    assert!(second.fencing_token > first.fencing_token);

    // The stale holder is fenced off.
    let err = leader.release_lock(&id, "worker-1", first.fencing_token).await.unwrap_err();
    assert_eq!(err.status, LockStatus::InvalidToken);
    assert!(leader.store().is_locked(&id));

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_extend_keeps_lock_alive() {
    let deployment = TestDeployment::start(&["us-east"], 1).await;
    let leader = deployment.leader("us-east").await;
    let id = lock_id();

    let lock = leader.acquire_lock(&id, "worker-1", Some(300)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    leader.extend_lock(&id, "worker-1", lock.fencing_token, Some(5_000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let info = leader.check_lock(&id).unwrap();
    assert_eq!(info.fencing_token, lock.fencing_token);
    assert!(info.ttl_ms > 1_000);

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_malformed_lock_id_is_rejected() {
    let deployment = TestDeployment::start(&["us-east"], 1).await;
    let leader = deployment.leader("us-east").await;
    let log_before = leader.raft().status().last_log_index;

    let err = leader.acquire_lock("invalid-lock-id", "worker-1", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::Error);
    assert!(leader.store().is_empty());
    assert_eq!(leader.raft().status().last_log_index, log_before);

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_locks_survive_leader_failover() {
    let deployment = TestDeployment::start(&["us-east"], 3).await;
    let region = deployment.region("us-east");
    let old_leader = region.leader().await;
    let id = lock_id();

    let lock = old_leader.acquire_lock(&id, "worker-1", Some(30_000)).await.unwrap();
    for service in region.services() {
        assert!(eventually(|| service.store().is_locked(&id)).await);
    }

    region.raft_net.isolate(old_leader.raft().node_id());
    let new_leader = loop {
        let candidate = region
            .services()
            .into_iter()
            .find(|s| s.raft().is_leader() && s.raft().node_id() != old_leader.raft().node_id());
        if let Some(service) = candidate {
            break service;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let err = new_leader.acquire_lock(&id, "worker-2", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::AlreadyLocked);
    assert_eq!(err.current_holder_id.as_deref(), Some("worker-1"));

    new_leader.release_lock(&id, "worker-1", lock.fencing_token).await.unwrap();
    let next = new_leader.acquire_lock(&id, "worker-2", None).await.unwrap();
    assert!(next.fencing_token > lock.fencing_token);

    region.raft_net.heal_all();
    deployment.shutdown().await;
}

#[tokio::test]
async fn test_locks_survive_restart() {
    let dir = TempDir::new().unwrap();
    let id = lock_id();

    let mut config = node_config("us-east", 1, 1, &["us-east"]);
    config.node.data_dir = Some(dir.path().to_path_buf());

    let start = |config| {
        let net = common::LockRaftNetwork::new();
        let regions = common::RegionNetwork::new();
        let node = build_region_node_with(config, net.rpc_for(1), regions.rpc_for("us-east"))
            .unwrap();
        net.register(node.raft.clone());
        node
    };

    let node = start(&config);
    node.raft.wait_for_leader(SETTLE).await.unwrap();
    let lock = node.service.acquire_lock(&id, "worker-1", Some(60_000)).await.unwrap();
    node.shutdown().await;

    let node = start(&config);
    node.raft.wait_for_leader(SETTLE).await.unwrap();
    let service: Arc<LockService> = Arc::clone(&node.service);
    assert!(eventually(|| service.store().is_locked(&id)).await);
    assert_eq!(service.check_lock(&id).unwrap().fencing_token, lock.fencing_token);

    service.release_lock(&id, "worker-1", lock.fencing_token).await.unwrap();
    let next = service.acquire_lock(&id, "worker-2", None).await.unwrap();
    assert_eq!(next.fencing_token, lock.fencing_token + 1);

    node.shutdown().await;
}

// =============================================================================
// Cross Region
// =============================================================================

const REGIONS: [&str; 3] = ["us-east", "eu-west", "ap-south"];

#[tokio::test]
async fn test_acquire_is_visible_in_peer_regions() {
    let deployment = TestDeployment::start(&REGIONS, 1).await;
    let us = deployment.leader("us-east").await;
    let eu = deployment.leader("eu-west").await;
    let ap = deployment.leader("ap-south").await;
    let id = lock_id();

    let lock = us.acquire_lock(&id, "worker-us", None).await.unwrap();
    assert!(eventually(|| eu.store().is_locked(&id) && ap.store().is_locked(&id)).await);

    let info = eu.check_lock(&id).unwrap();
    assert_eq!(info.holder_region, "us-east");
    assert_eq!(info.fencing_token, lock.fencing_token);

    let err = eu.acquire_lock(&id, "worker-eu", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::AlreadyLocked);
    assert_eq!(err.current_holder_id.as_deref(), Some("worker-us"));

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_release_frees_lock_everywhere() {
    let deployment = TestDeployment::start(&REGIONS, 1).await;
    let us = deployment.leader("us-east").await;
    let eu = deployment.leader("eu-west").await;
    let id = lock_id();

    let lock = us.acquire_lock(&id, "worker-us", None).await.unwrap();
    assert!(eventually(|| eu.store().is_locked(&id)).await);

    us.release_lock(&id, "worker-us", lock.fencing_token).await.unwrap();
    assert!(eventually(|| !eu.store().is_locked(&id)).await);

    let taken = eu.acquire_lock(&id, "worker-eu", None).await.unwrap();
    assert_eq!(taken.holder_region, "eu-west");
    assert!(taken.fencing_token > lock.fencing_token);

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_quorum_survives_one_region_down() {
    let deployment = TestDeployment::start(&REGIONS, 1).await;
    let us = deployment.leader("us-east").await;
    deployment.region_net.partition("ap-south");

    let lock = us.acquire_lock(&lock_id(), "worker-us", None).await.unwrap();
    assert_eq!(lock.holder_region, "us-east");

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_isolated_region_fails_and_compensates() {
    let deployment = TestDeployment::start(&REGIONS, 1).await;
    let us = deployment.leader("us-east").await;
    let id = lock_id();
    deployment.region_net.partition("us-east");

    let err = us.acquire_lock(&id, "worker-us", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::QuorumFailed);
    assert!(err.is_retryable());
    assert!(!us.store().is_locked(&id));

    deployment.region_net.heal("us-east");
    let lock = us.acquire_lock(&id, "worker-us", None).await.unwrap();
    assert!(lock.fencing_token >= 2);

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_peer_region_keeps_shadow_across_failover() {
    let deployment = TestDeployment::start(&REGIONS, 3).await;
    let eu = deployment.region("eu-west");
    let eu_leader = eu.leader().await.raft().node_id();

    // Traffic for eu-west lands on one follower, which must hand it on.
    let entry = eu.followers().remove(0);
    entry
        .raft()
        .wait_for(SETTLE, |s| s.leader_id == Some(eu_leader))
        .await
        .unwrap();
    let entry_id = entry.raft().node_id();
    deployment
        .region_net
        .set_entry("eu-west", common::member_addr("eu-west", entry_id));

    // ap-south never hears of the lock; us-east wins with eu-west's vote.
    deployment.region_net.partition("ap-south");
    let us = deployment.leader("us-east").await;
    let id = lock_id();
    let lock = us.acquire_lock(&id, "worker-us", Some(60_000)).await.unwrap();

    for service in eu.services() {
        assert!(eventually(|| service.store().is_locked(&id)).await);
    }

    eu.raft_net.isolate(eu_leader);
    entry
        .raft()
        .wait_for(SETTLE, |s| s.leader_id.is_some() && s.leader_id != Some(eu_leader))
        .await
        .unwrap();
    let survivors: Vec<_> = eu
        .services()
        .into_iter()
        .filter(|s| s.raft().node_id() != eu_leader)
        .collect();
    for service in &survivors {
        let info = service.check_lock(&id).unwrap();
        assert_eq!(info.holder_region, "us-east");
        assert_eq!(info.fencing_token, lock.fencing_token);
    }

    // Outlive every vote promise from the first round, then let ap-south try
    // while us-east cannot answer. Only eu-west's new leader can refuse.
    tokio::time::sleep(Duration::from_millis(400)).await;
    deployment.region_net.heal("ap-south");
    deployment.region_net.partition("us-east");

    let ap = deployment.leader("ap-south").await;
    let err = ap.acquire_lock(&id, "worker-ap", None).await.unwrap_err();
    assert_eq!(err.status, LockStatus::QuorumFailed);
    assert_eq!(err.current_holder_id.as_deref(), Some("worker-us"));
    assert!(!ap.store().is_locked(&id));

    for service in &survivors {
        assert_eq!(service.check_lock(&id).unwrap().holder_region, "us-east");
    }

    eu.raft_net.heal_all();
    deployment.shutdown().await;
}

#[tokio::test]
async fn test_follower_forwards_region_traffic() {
    let deployment = TestDeployment::start(&["us-east", "eu-west"], 3).await;
    let eu = deployment.region("eu-west");
    let eu_leader = eu.leader().await;

    let entry = eu.followers().remove(0);
    entry
        .raft()
        .wait_for(SETTLE, |s| s.leader_id == Some(eu_leader.raft().node_id()))
        .await
        .unwrap();
    deployment
        .region_net
        .set_entry("eu-west", common::member_addr("eu-west", entry.raft().node_id()));

    let us = deployment.leader("us-east").await;
    let id = lock_id();
    let lock = us.acquire_lock(&id, "worker-us", None).await.unwrap();

    // The follower answered through the leader, which logged the token.
    let token = lock.fencing_token;
    for service in eu.services() {
        assert!(eventually(|| service.store().tokens().current_token(&id) >= token).await);
        assert!(eventually(|| service.store().is_locked(&id)).await);
    }

    us.release_lock(&id, "worker-us", lock.fencing_token).await.unwrap();
    for service in eu.services() {
        assert!(eventually(|| !service.store().is_locked(&id)).await);
    }

    deployment.shutdown().await;
}

#[tokio::test]
async fn test_racing_regions_never_both_win() {
    for _ in 0..5 {
        let deployment = TestDeployment::start(&REGIONS, 1).await;
        let us = deployment.leader("us-east").await;
        let eu = deployment.leader("eu-west").await;
        let id = lock_id();

        let (a, b) = tokio::join!(
            us.acquire_lock(&id, "worker-us", None),
            eu.acquire_lock(&id, "worker-eu", None),
        );
        assert!(
            !(a.is_ok() && b.is_ok()),
            "both regions acquired {}",
            id
        );

        deployment.shutdown().await;
    }
}

#[tokio::test]
async fn test_single_region_deployment_needs_no_peers() {
    let deployment = TestDeployment::start(&["solo"], 1).await;
    let leader = deployment.leader("solo").await;

    let result = leader
        .quorum()
        .request_lock_quorum(&lock_id(), "worker-1", 1, 1_000)
        .await
        .unwrap();
    assert_eq!(result.votes_received, 1);
    assert_eq!(result.total_regions, 1);

    deployment.shutdown().await;
}
