// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group create/destroy fan-out across several runtimes on one loopback fabric.

mod common;

use common::{Cluster, Outcomes, PUMP_TIMEOUT};
use hcrt::{Error, GroupStatus};

fn create_and_wait(cluster: &Cluster, rank: usize, id: &str, members: &[u32]) -> hcrt::Result<()> {
    let done = Outcomes::new();
    cluster.ranks[rank]
        .group_create(id, members, done.recorder())
        .expect("create accepted");
    assert!(cluster.pump_until(PUMP_TIMEOUT, || done.len() == 1));
    done.results().remove(0)
}

fn destroy_and_wait(cluster: &Cluster, rank: usize, id: &str) -> hcrt::Result<()> {
    let rt = &cluster.ranks[rank];
    let grp = rt.group_lookup(id).expect("group to destroy");
    let done = Outcomes::new();
    rt.group_destroy(&grp, done.recorder()).expect("destroy accepted");
    assert!(cluster.pump_until(PUMP_TIMEOUT, || done.len() == 1));
    done.results().remove(0)
}

#[test]
fn test_create_registers_group_on_every_member() {
    let cluster = Cluster::new(4);
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[2, 0, 1]), Ok(()));

    for rank in 0..3 {
        let grp = cluster.ranks[rank].group_lookup("g1").expect("member knows g1");
        assert_eq!(grp.members(), &[0, 1, 2]);
        assert_eq!(grp.status(), GroupStatus::Normal);
        assert_eq!(grp.initiator(), 0);
        assert_eq!(cluster.ranks[rank].group_rank(Some(&grp)), Ok(rank as u32));
        assert_eq!(cluster.ranks[rank].group_size(Some(&grp)), 3);
    }
    assert!(cluster.ranks[3].group_lookup("g1").is_none());
    for ctx in &cluster.ctxs {
        assert!(ctx.is_idle());
    }
}

#[test]
fn test_duplicate_create_joins_running_protocol() {
    let cluster = Cluster::new(3);
    let rt = &cluster.ranks[0];
    let done = Outcomes::new();
    rt.group_create("g1", &[0, 1, 2], done.recorder()).expect("first");
    rt.group_create("g1", &[2, 1, 0], done.recorder()).expect("second joins");

    // Still creating: one record, nobody completed yet.
    let grp = rt.group_lookup("g1").expect("registered");
    assert_eq!(grp.status(), GroupStatus::Creating);
    assert_eq!(done.len(), 0);

    assert!(cluster.pump_until(PUMP_TIMEOUT, || done.len() == 2));
    assert_eq!(done.results(), vec![Ok(()), Ok(())]);
    assert!(rt.group_lookup("g1").expect("still registered").ptr_eq(&grp));

    // Re-creating a finished group from its initiator succeeds at once.
    let again = Outcomes::new();
    rt.group_create("g1", &[0, 1, 2], again.recorder()).expect("idempotent");
    assert_eq!(again.results(), vec![Ok(())]);
}

#[test]
fn test_conflicting_creates_are_rejected() {
    let cluster = Cluster::new(4);
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[0, 1, 2]), Ok(()));

    // Not a member.
    assert!(matches!(
        cluster.ranks[3].group_create("g1", &[0, 1, 2], |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    // Different membership.
    assert!(matches!(
        cluster.ranks[0].group_create("g1", &[0, 1], |_| {}),
        Err(Error::AlreadyExists(_))
    ));
    // Same membership, other initiator.
    assert!(matches!(
        cluster.ranks[1].group_create("g1", &[0, 1, 2], |_| {}),
        Err(Error::AlreadyExists(_))
    ));
    // Bad identifiers never reach the registry.
    assert!(matches!(
        cluster.ranks[0].group_create("bad\"id", &[0], |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cluster.ranks[0].group_create("g2", &[], |_| {}),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_refused_send_aggregates_and_tears_down() {
    let cluster = Cluster::new(3);
    cluster.fabric.fail_sends_to(1);

    let result = create_and_wait(&cluster, 0, "g1", &[0, 1, 2]);
    match result {
        Err(Error::Aggregate(first)) => assert!(matches!(*first, Error::Transport(_))),
        other => panic!("expected aggregate, got {:?}", other),
    }
    assert!(cluster.ranks[0].group_lookup("g1").is_none());
    // The leg to rank 2 was never sent.
    assert!(cluster.ranks[2].group_lookup("g1").is_none());
    assert!(cluster.pump_until(PUMP_TIMEOUT, || cluster.ctxs[0].is_idle()));
}

#[test]
fn test_failed_delivery_aggregates_and_retry_succeeds() {
    let cluster = Cluster::new(3);
    cluster.fabric.fail_deliveries_to(1);

    let result = create_and_wait(&cluster, 0, "g1", &[0, 1, 2]);
    assert_eq!(result, Err(Error::aggregate(Error::Unreachable(1))));
    assert!(cluster.ranks[0].group_lookup("g1").is_none());
    assert!(cluster.ranks[1].group_lookup("g1").is_none());
    // Rank 2 acknowledged and keeps its record.
    assert!(cluster.ranks[2].group_lookup("g1").is_some());

    cluster.fabric.heal(1);
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[0, 1, 2]), Ok(()));
    for rt in &cluster.ranks {
        assert_eq!(
            rt.group_lookup("g1").map(|g| g.status()),
            Some(GroupStatus::Normal)
        );
    }
}

#[test]
fn test_remote_membership_conflict_is_reported() {
    let cluster = Cluster::new(3);
    assert_eq!(create_and_wait(&cluster, 1, "g2", &[1, 2]), Ok(()));

    let result = create_and_wait(&cluster, 0, "g2", &[0, 1, 2]);
    match result {
        Err(Error::Aggregate(first)) => assert!(matches!(*first, Error::AlreadyExists(_))),
        other => panic!("expected aggregate, got {:?}", other),
    }
    assert!(cluster.ranks[0].group_lookup("g2").is_none());
    assert_eq!(
        cluster.ranks[1].group_lookup("g2").map(|g| g.members().to_vec()),
        Some(vec![1, 2])
    );
}

#[test]
fn test_single_member_round_trip() {
    let cluster = Cluster::new(1);
    let rt = &cluster.ranks[0];
    let created = Outcomes::new();
    rt.group_create("g1", &[0], created.recorder()).expect("create");

    let creating = rt.group_lookup("g1").expect("registered");
    assert!(matches!(
        rt.group_destroy(&creating, |_| {}),
        Err(Error::Busy(_))
    ));

    assert!(cluster.pump_until(PUMP_TIMEOUT, || created.len() == 1));
    assert_eq!(created.results(), vec![Ok(())]);

    let destroyed = Outcomes::new();
    let grp = rt.group_lookup("g1").expect("created");
    rt.group_destroy(&grp, destroyed.recorder()).expect("destroy");
    assert!(matches!(rt.group_destroy(&grp, |_| {}), Err(Error::Busy(_))));
    assert!(cluster.pump_until(PUMP_TIMEOUT, || destroyed.len() == 1));
    assert_eq!(destroyed.results(), vec![Ok(())]);

    assert!(rt.group_lookup("g1").is_none());
    assert!(grp.is_finalizing());
    assert!(matches!(rt.group_destroy(&grp, |_| {}), Err(Error::NotFound(_))));

    // The identifier is free again.
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[0]), Ok(()));
}

#[test]
fn test_destroy_removes_group_everywhere() {
    let cluster = Cluster::new(3);
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[0, 1, 2]), Ok(()));
    assert_eq!(destroy_and_wait(&cluster, 0, "g1"), Ok(()));
    for rt in &cluster.ranks {
        assert!(rt.group_lookup("g1").is_none());
    }
}

#[test]
fn test_failed_destroy_keeps_group_up() {
    let cluster = Cluster::new(3);
    assert_eq!(create_and_wait(&cluster, 0, "g1", &[0, 1, 2]), Ok(()));

    cluster.fabric.fail_deliveries_to(2);
    let result = destroy_and_wait(&cluster, 0, "g1");
    assert_eq!(result, Err(Error::aggregate(Error::Unreachable(2))));

    let grp = cluster.ranks[0].group_lookup("g1").expect("still up");
    assert_eq!(grp.status(), GroupStatus::Normal);
    assert!(cluster.ranks[2].group_lookup("g1").is_some());

    cluster.fabric.heal(2);
    assert_eq!(destroy_and_wait(&cluster, 0, "g1"), Ok(()));
    assert!(cluster.ranks[0].group_lookup("g1").is_none());
    assert!(cluster.ranks[2].group_lookup("g1").is_none());
}

#[test]
fn test_group_calls_need_local_protocol_group() {
    let cluster = Cluster::new(2);
    let rt = &cluster.ranks[0];
    let attached = rt.group_attach("remote", &[1]).expect("attach");
    assert!(matches!(
        rt.group_destroy(&attached, |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        rt.group_destroy(rt.primary_group(), |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(rt.group_size(None), 2);
}

/// Aggregation does not depend on the order legs complete in.
#[test]
fn test_aggregate_is_order_independent() {
    const SIZE: u32 = 6;
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    for round in 0..20 {
        let cluster = Cluster::new(SIZE);
        let failing = if round % 2 == 0 {
            None
        } else {
            Some(rng.u32(1..SIZE))
        };
        if let Some(rank) = failing {
            cluster.fabric.fail_deliveries_to(rank);
        }

        let members: Vec<u32> = (0..SIZE).collect();
        let done = Outcomes::new();
        cluster.ranks[0]
            .group_create("shuffled", &members, done.recorder())
            .expect("create");

        let mut order: Vec<usize> = (0..SIZE as usize).collect();
        for _ in 0..10_000 {
            if done.len() == 1 {
                break;
            }
            rng.shuffle(&mut order);
            cluster.pump_order(&order);
        }

        let result = done.results().remove(0);
        match failing {
            None => assert_eq!(result, Ok(()), "round {}", round),
            Some(rank) => assert_eq!(
                result,
                Err(Error::aggregate(Error::Unreachable(rank))),
                "round {}",
                round
            ),
        }
    }
}
