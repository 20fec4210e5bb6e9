//! Fixed test vectors and scenarios for ledger replay.

use std::{sync::Arc, time::Duration};

use ledger_replay_test::prelude::*;

use crate::{
    ledger::{decode_skip_list, encode_skip_list, skip_list_hash, Hash, Reason, Transaction},
    message::{ReplayDeltaResponse, ReplyError, Request, SkipListResponse},
    mock::{next_ledger, StoreCall},
    service_traits::{ApplyFlags, Peer},
    AcquireStatus, Config, DeltaStatus, OverlayPeerSet, PeerSet, ReplayError, ReplayMsgHandler,
    ResponseError, SerializationError, TaskStatus,
};

use super::{replay_config, TestNetwork};

#[test]
fn replay_builds_every_ledger_in_the_range() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true), (2, true)]);
    net.give_client(10);
    let finish = net.ledger(20);

    net.replayer.replay(Reason::Generic, finish.hash(), 11);
    assert_eq!(net.replayer.task_count(), 1);
    assert_eq!(net.replayer.skip_list_count(), 1);

    let task = net.replayer.tasks()[0].clone();
    assert_eq!(task.status(), TaskStatus::AcquiringSkipList);

    net.run();

    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(task.parent(), Some(finish.clone()));
    assert_eq!(task.delta_to_build(), 10);
    assert_eq!(net.replayer.delta_count(), 10);
    assert_eq!(net.client.builder.build_count(), 10);

    // Replayed transactions are fully checked.
    let flags = net.client.builder.build_flags();
    assert_eq!(flags.len(), 10);
    assert!(flags
        .iter()
        .all(|flags| !flags.contains(ApplyFlags::NO_CHECK_SIGN)));

    let calls = net.client.store.calls();
    for seq in 11..=20 {
        let hash = net.ledger(seq).hash();
        assert!(calls.contains(&StoreCall::StoreLedger(hash)), "ledger {seq} was not stored");
        assert!(calls.contains(&StoreCall::CheckAccept(hash)), "ledger {seq} was not offered");
        assert!(net.client.store.contains(hash));
    }
    assert_eq!(
        calls.iter().filter(|call| **call == StoreCall::TryAdvance).count(),
        10
    );

    let parameter = task.parameter();
    assert_eq!(parameter.start_seq(), 10);
    assert_eq!(parameter.start_hash(), net.ledger(10).hash());
    assert_eq!(parameter.finish_seq(), 20);

    Ok(())
}

#[test]
fn out_of_order_deltas_are_built_in_order() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(10);

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 11);
    let task = net.replayer.tasks()[0].clone();

    // The skip list request, which creates the deltas.
    for request in net.take_requests() {
        net.answer(request);
    }
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);
    assert_eq!(task.delta_count(), 10);

    let mut delta_requests = net.take_requests();
    assert_eq!(delta_requests.len(), 10);
    delta_requests.reverse();

    let (first, later) = delta_requests.split_last().expect("10 requests");
    for request in later {
        net.answer(request.clone());
        assert_eq!(task.delta_to_build(), 0, "nothing builds before the first delta");
    }

    net.answer(first.clone());
    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(task.delta_to_build(), 10);

    net.client.jobs.run_pending_jobs();
    for seq in 11..=20 {
        assert!(net.client.store.contains(net.ledger(seq).hash()));
    }

    Ok(())
}

#[test]
fn local_ledgers_short_circuit_peer_requests() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(12, &[(1, true)]);
    for seq in 4..=12 {
        net.give_client(seq);
    }

    net.replayer.replay(Reason::Generic, net.ledger(12).hash(), 9);
    let task = net.replayer.tasks()[0].clone();

    assert_eq!(task.status(), TaskStatus::Complete);
    assert!(net.take_requests().is_empty());
    assert_eq!(net.client.builder.build_count(), 0);

    for seq in 5..=12 {
        let delta = net
            .replayer
            .delta(net.ledger(seq).hash())
            .expect("delta is used by a live task");
        assert_eq!(delta.status(), DeltaStatus::Built);
    }

    // Local ledgers are already stored.
    assert_eq!(net.client.jobs.run_pending_jobs(), 0);
    assert!(net.client.store.calls().is_empty());

    Ok(())
}

#[test]
fn identical_requests_share_sub_tasks() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(9);
    net.give_client(10);
    let finish = net.ledger(20).hash();

    // Until the skip list arrives, no range is known, so nothing merges.
    net.replayer.replay(Reason::Generic, finish, 11);
    net.replayer.replay(Reason::Generic, finish, 11);
    net.replayer.replay(Reason::Generic, finish, 5);
    net.replayer.replay(Reason::Generic, finish, 12);
    assert_eq!(net.replayer.task_count(), 4);
    assert_eq!(net.replayer.skip_list_count(), 1);
    assert_eq!(net.take_requests().len(), 1, "one skip list request");

    net.answer(Request::SkipList { ledger_hash: finish });
    net.run();

    for task in net.replayer.tasks() {
        assert_eq!(task.status(), TaskStatus::Complete);
    }

    // Ledger 10 is local, and each shared delta is only replayed once.
    assert_eq!(net.replayer.delta_count(), 11);
    assert_eq!(net.client.builder.build_count(), 10);

    // Known ranges absorb the same requests.
    net.replayer.replay(Reason::Generic, finish, 5);
    net.replayer.replay(Reason::Generic, finish, 12);
    assert_eq!(net.replayer.task_count(), 4);

    Ok(())
}

#[test]
fn same_target_requests_wait_for_the_existing_range() -> Result<()> {
    ledger_replay_test::init();

    // Ledger 5's skip list only reaches back to ledger 1.
    let net = TestNetwork::new(5, &[(1, true)]);
    net.give_client(3);
    let finish = net.ledger(5).hash();

    net.replayer.replay(Reason::Generic, finish, 6);
    net.replayer.replay(Reason::Generic, finish, 3);
    assert_eq!(net.replayer.task_count(), 2);

    net.run();

    let tasks = net.replayer.tasks();
    assert_eq!(tasks[0].status(), TaskStatus::Failed);
    assert_eq!(tasks[1].status(), TaskStatus::Complete);
    assert!(net.client.store.contains(net.ledger(4).hash()));
    assert!(net.client.store.contains(net.ledger(5).hash()));

    Ok(())
}

#[test]
fn contained_ranges_merge_and_new_reasons_reuse_built_ledgers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(16);

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 5);
    net.run();
    assert_eq!(net.replayer.tasks()[0].status(), TaskStatus::Complete);
    assert_eq!(net.client.builder.build_count(), 4);

    // Ledgers 17..=19 are inside 16..=20.
    net.replayer.replay(Reason::Generic, net.ledger(19).hash(), 3);
    assert_eq!(net.replayer.task_count(), 1);

    // Ledgers 15..=19 start before the existing range.
    net.replayer.replay(Reason::Generic, net.ledger(19).hash(), 5);
    assert_eq!(net.replayer.task_count(), 2);

    // The same range for another reason doesn't merge, but reuses the built deltas.
    net.replayer.replay(Reason::History, net.ledger(19).hash(), 3);
    assert_eq!(net.replayer.task_count(), 3);

    let history_task = net
        .replayer
        .tasks()
        .into_iter()
        .find(|task| task.reason() == Reason::History)
        .expect("history task was created");
    assert_eq!(history_task.status(), TaskStatus::Complete);

    let delta_19 = net.replayer.delta(net.ledger(19).hash()).expect("live delta");
    assert_eq!(delta_19.reasons(), vec![Reason::History, Reason::Generic]);

    net.client.jobs.run_pending_jobs();
    let calls = net.client.store.calls();
    assert!(calls.contains(&StoreCall::OnLedgerFetched(net.ledger(18).hash())));
    assert!(calls.contains(&StoreCall::OnLedgerFetched(net.ledger(19).hash())));
    assert_eq!(net.client.builder.build_count(), 4);

    Ok(())
}

#[test]
fn requests_over_the_task_limit_are_dropped() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    let max_tasks = net.replayer.config().max_tasks;

    for seq in 5..=(5 + max_tasks as u32) {
        net.replayer.replay(Reason::Generic, net.ledger(seq).hash(), 1);
    }

    assert_eq!(net.replayer.task_count(), max_tasks);
    assert_eq!(net.replayer.skip_list_count(), max_tasks);
    assert!(net.replayer.skip_list(net.ledger(5 + max_tasks as u32).hash()).is_none());

    Ok(())
}

#[test]
fn invalid_requests_are_dropped() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(5, &[(1, true)]);
    let finish = net.ledger(5).hash();

    net.replayer.replay(Reason::Generic, Hash::ZERO, 1);
    net.replayer.replay(Reason::Generic, finish, 0);
    net.replayer.replay(
        Reason::Generic,
        finish,
        net.replayer.config().max_task_size + 1,
    );
    assert_eq!(net.replayer.task_count(), 0);
    assert!(net.take_requests().is_empty());

    let disabled = TestNetwork::with_config(5, &[(1, true)], Config::default());
    disabled.replayer.replay(Reason::Generic, finish, 2);
    assert_eq!(disabled.replayer.task_count(), 0);
    assert!(disabled.take_requests().is_empty());

    Ok(())
}

#[test]
fn replayed_ledgers_must_match_their_hash() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(10);
    net.client.builder.set_corrupt(true);

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 11);
    let task = net.replayer.tasks()[0].clone();
    net.run();

    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.delta_to_build(), 0);
    assert_eq!(
        net.replayer.delta(net.ledger(11).hash()).map(|delta| delta.status()),
        Some(DeltaStatus::Failed)
    );
    assert!(!net
        .client
        .store
        .calls()
        .iter()
        .any(|call| matches!(call, StoreCall::StoreLedger(_))));

    Ok(())
}

#[test]
fn builder_failures_fail_the_task() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(8, &[(1, true)]);
    net.give_client(5);
    net.client.builder.set_refuse(true);

    net.replayer.replay(Reason::Generic, net.ledger(8).hash(), 4);
    let task = net.replayer.tasks()[0].clone();
    net.run();

    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(net.client.builder.build_count(), 1);

    Ok(())
}

#[test]
fn try_build_checks_the_parent_and_caches_the_ledger() -> Result<()> {
    ledger_replay_test::init();

    // The client doesn't have the first ledger, so the task can't build.
    let net = TestNetwork::new(12, &[(1, true)]);
    net.replayer.replay(Reason::Generic, net.ledger(12).hash(), 3);
    let task = net.replayer.tasks()[0].clone();
    net.run();
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);

    let delta_11 = net.replayer.delta(net.ledger(11).hash()).expect("live delta");
    let delta_12 = net.replayer.delta(net.ledger(12).hash()).expect("live delta");
    assert_eq!(delta_11.status(), DeltaStatus::HeaderReady);

    let built = delta_11
        .try_build(&net.ledger(10))?
        .expect("delta is ready");
    assert_eq!(built, net.ledger(11));
    assert_eq!(delta_11.status(), DeltaStatus::Built);

    let again = delta_11
        .try_build(&net.ledger(10))?
        .expect("delta is built");
    assert!(Arc::ptr_eq(&built, &again));
    assert_eq!(net.client.builder.build_count(), 1);

    // A ledger with the right sequence number, on another fork.
    let fork = next_ledger(&net.ledger(10), Default::default(), 12345);
    assert_eq!(
        delta_12.try_build(&fork),
        Err(ReplayError::ParentMismatch {
            hash: net.ledger(12).hash(),
            expected_parent: net.ledger(11).hash(),
            parent: fork.hash(),
        })
    );
    assert_eq!(delta_12.status(), DeltaStatus::Failed);
    assert_eq!(
        delta_12.try_build(&net.ledger(11)),
        Err(ReplayError::SubTaskFailed(net.ledger(12).hash()))
    );

    // Tasks are told about build failures from a job.
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);
    assert_eq!(
        net.client.jobs.queued_job_names(),
        ["LedgerReplayStore", "LedgerReplayDeltaFailed"]
    );
    net.client.jobs.run_pending_jobs();
    assert_eq!(task.status(), TaskStatus::Failed);

    Ok(())
}

#[test]
fn build_failures_are_dropped_by_a_closed_job_queue() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(12, &[(1, true)]);
    net.replayer.replay(Reason::Generic, net.ledger(12).hash(), 3);
    let task = net.replayer.tasks()[0].clone();
    net.run();

    let delta_11 = net.replayer.delta(net.ledger(11).hash()).expect("live delta");
    assert_eq!(delta_11.status(), DeltaStatus::HeaderReady);

    net.client.jobs.shut_down();

    let fork = next_ledger(&net.ledger(9), Default::default(), 12345);
    assert!(matches!(
        delta_11.try_build(&fork),
        Err(ReplayError::ParentMismatch { .. })
    ));
    assert_eq!(delta_11.status(), DeltaStatus::Failed);

    // The failure has nowhere to go.
    assert!(net.client.jobs.queued_job_names().is_empty());
    assert_eq!(net.client.jobs.run_pending_jobs(), 0);
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);

    Ok(())
}

#[test]
fn failed_acquisitions_are_replaced_for_new_tasks() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(12, &[(1, true)]);
    net.give_client(10);
    let finish = net.ledger(12).hash();

    net.client.builder.set_corrupt(true);
    net.replayer.replay(Reason::Generic, finish, 3);
    let failed_task = net.replayer.tasks()[0].clone();
    net.run();

    assert_eq!(failed_task.status(), TaskStatus::Failed);
    let failed_delta = net.replayer.delta(net.ledger(11).hash()).expect("live delta");
    assert_eq!(failed_delta.status(), DeltaStatus::Failed);
    assert_eq!(net.client.builder.build_count(), 1);

    // The skip list and ledger 12 are still good, ledger 11 is acquired again.
    net.client.builder.set_corrupt(false);
    net.replayer.replay(Reason::Generic, finish, 3);
    assert_eq!(net.replayer.task_count(), 2);
    let task = net.replayer.tasks()[1].clone();
    net.run();

    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(task.parent(), Some(net.ledger(12)));

    let delta = net.replayer.delta(net.ledger(11).hash()).expect("live delta");
    assert!(!Arc::ptr_eq(&delta, &failed_delta));
    assert_eq!(delta.status(), DeltaStatus::Built);
    assert_eq!(net.client.builder.build_count(), 3);

    // Dropping the old acquisition leaves its replacement registered.
    drop(failed_delta);
    drop(failed_task);
    net.replayer.sweep();
    assert_eq!(net.replayer.task_count(), 0);
    let registered = net.replayer.delta(net.ledger(11).hash()).expect("live delta");
    assert!(Arc::ptr_eq(&registered, &delta));

    Ok(())
}

#[test]
fn failed_skip_lists_are_replaced_for_new_tasks() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(12, &[(1, true)]);
    net.give_client(10);
    let max_timeouts = net.replayer.config().sub_task_max_timeouts;
    let finish = net.ledger(12).hash();

    net.replayer.replay(Reason::Generic, finish, 3);
    let failed_task = net.replayer.tasks()[0].clone();
    let failed_skip_list = net.replayer.skip_list(finish).expect("live skip list");
    for _ in 0..=max_timeouts {
        net.client.jobs.tick();
    }
    assert_eq!(failed_task.status(), TaskStatus::Failed);
    assert_eq!(failed_skip_list.status(), AcquireStatus::Failed);
    net.take_requests();

    net.replayer.replay(Reason::Generic, finish, 3);
    let task = net.replayer.tasks()[1].clone();
    assert_eq!(task.status(), TaskStatus::AcquiringSkipList);

    let skip_list = net.replayer.skip_list(finish).expect("live skip list");
    assert!(!Arc::ptr_eq(&skip_list, &failed_skip_list));
    assert_eq!(
        net.take_requests(),
        vec![Request::SkipList { ledger_hash: finish }]
    );

    net.answer(Request::SkipList { ledger_hash: finish });
    net.run();
    assert_eq!(task.status(), TaskStatus::Complete);

    Ok(())
}

#[test]
fn peers_without_replay_support_fall_back_to_inbound_ledgers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(10, &[(1, false), (2, false), (3, false)]);
    for ledger in &net.chain {
        net.client.inbound.insert(ledger.clone());
    }
    let finish = net.ledger(10).hash();

    net.replayer.replay(Reason::Generic, finish, 5);
    let task = net.replayer.tasks()[0].clone();
    let skip_list = net.replayer.skip_list(finish).expect("live skip list");

    // One peer without support isn't enough to fall back.
    assert_eq!(skip_list.status(), AcquireStatus::Pending);
    assert!(net.client.inbound.requests().is_empty());

    net.client.jobs.tick();
    assert_eq!(skip_list.status(), AcquireStatus::Complete);
    assert!(net
        .client
        .inbound
        .requests()
        .contains(&(finish, 0, Reason::Generic)));
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);

    net.client.jobs.tick();
    assert_eq!(task.status(), TaskStatus::Complete);
    assert_eq!(task.parent().map(|ledger| ledger.hash()), Some(finish));

    assert!(net.take_requests().is_empty(), "no replay requests were sent");
    assert_eq!(net.client.builder.build_count(), 0);

    Ok(())
}

#[test]
fn fallback_waits_longer_between_retries() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(10, &[(1, false), (2, false), (3, false)]);
    let config = net.replayer.config().clone();

    net.replayer.replay(Reason::Generic, net.ledger(10).hash(), 5);
    assert!(net.client.jobs.timer_delays().contains(&config.sub_task_timeout));

    net.client.jobs.tick();
    let delays = net.client.jobs.timer_delays();
    assert!(delays.contains(&config.sub_task_fallback_timeout));
    assert!(!delays.contains(&config.sub_task_timeout));

    Ok(())
}

#[test]
fn sub_task_timeouts_fail_dependent_tasks() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(30, &[(1, true)]);
    let max_timeouts = net.replayer.config().sub_task_max_timeouts;

    net.replayer.replay(Reason::Generic, net.ledger(30).hash(), 20);
    let task = net.replayer.tasks()[0].clone();

    for _ in 0..max_timeouts {
        net.client.jobs.tick();
    }
    assert_eq!(task.status(), TaskStatus::AcquiringSkipList);

    net.client.jobs.tick();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(
        net.replayer
            .skip_list(net.ledger(30).hash())
            .map(|skip_list| skip_list.status()),
        Some(AcquireStatus::Failed)
    );

    // Nothing is left to retry.
    net.client.jobs.tick();
    assert!(net.client.jobs.timer_delays().is_empty());

    Ok(())
}

#[test]
fn task_timeouts_scale_with_the_range() -> Result<()> {
    ledger_replay_test::init();

    let config = replay_config();
    assert_eq!(config.task_max_timeouts(1), config.task_max_timeouts_minimum);
    assert_eq!(config.task_max_timeouts(100), 200);

    // No peers, and a skip list that never fails.
    let net = TestNetwork::with_config(
        10,
        &[],
        Config {
            sub_task_max_timeouts: 1000,
            ..replay_config()
        },
    );

    net.replayer.replay(Reason::Generic, net.ledger(10).hash(), 3);
    let task = net.replayer.tasks()[0].clone();

    for _ in 0..config.task_max_timeouts_minimum {
        net.client.jobs.tick();
    }
    assert_eq!(task.status(), TaskStatus::AcquiringSkipList);

    net.client.jobs.tick();
    assert_eq!(task.status(), TaskStatus::Failed);

    Ok(())
}

#[test]
fn busy_job_queues_defer_timers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(30, &[(1, true)]);
    let config = net.replayer.config().clone();

    net.replayer.replay(Reason::Generic, net.ledger(30).hash(), 20);
    let task = net.replayer.tasks()[0].clone();

    net.client.jobs.set_busy(config.max_queued_tasks);
    for _ in 0..(config.sub_task_max_timeouts * 3) {
        net.client.jobs.tick();
        assert!(!net.client.jobs.timer_delays().is_empty(), "timers are re-armed");
    }
    assert_eq!(task.status(), TaskStatus::AcquiringSkipList);

    net.client.jobs.set_busy(0);
    for _ in 0..=config.sub_task_max_timeouts {
        net.client.jobs.tick();
    }
    assert_eq!(task.status(), TaskStatus::Failed);

    Ok(())
}

#[test]
fn store_actions_depend_on_the_reasons() -> Result<()> {
    ledger_replay_test::init();

    fn replay_for(reasons: &[Reason]) -> (TestNetwork, Vec<StoreCall>) {
        let net = TestNetwork::new(6, &[(1, true)]);
        net.give_client(3);

        for reason in reasons {
            net.replayer.replay(*reason, net.ledger(6).hash(), 4);
        }
        assert_eq!(net.replayer.task_count(), reasons.len());

        net.run();
        for task in net.replayer.tasks() {
            assert_eq!(task.status(), TaskStatus::Complete);
        }

        let calls = net.client.store.calls();
        (net, calls)
    }

    fn count(calls: &[StoreCall], f: impl Fn(&StoreCall) -> bool) -> usize {
        calls.iter().filter(|call| f(call)).count()
    }

    let (net, calls) = replay_for(&[Reason::Generic]);
    let hash = net.ledger(4).hash();
    assert_eq!(
        calls[..3],
        [
            StoreCall::StoreLedger(hash),
            StoreCall::CheckAccept(hash),
            StoreCall::TryAdvance
        ]
    );
    assert_eq!(calls.len(), 9);

    let (_, calls) = replay_for(&[Reason::Generic, Reason::Consensus]);
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::StoreLedger(_))), 3);
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::CheckAccept(_))), 3);

    let (_, calls) = replay_for(&[Reason::History]);
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::StoreLedger(_))), 0);
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::OnLedgerFetched(_))), 3);

    let (net, calls) = replay_for(&[Reason::Shard]);
    let hash = net.ledger(4).hash();
    assert_eq!(
        calls[..2],
        [StoreCall::SetShardStored(hash), StoreCall::OnLedgerFetched(hash)]
    );
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::StoreLedger(_))), 0);

    let (net, calls) = replay_for(&[Reason::History, Reason::Shard]);
    let hash = net.ledger(4).hash();
    assert_eq!(
        calls[..2],
        [StoreCall::SetShardStored(hash), StoreCall::OnLedgerFetched(hash)]
    );
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::OnLedgerFetched(_))), 3);
    assert_eq!(count(&calls, |c| matches!(c, StoreCall::SetShardStored(_))), 3);

    Ok(())
}

#[test]
fn sweep_removes_finished_tasks_and_unused_sub_tasks() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(10);

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 11);
    net.run();

    // A task that is still waiting for its skip list.
    net.replayer.replay(Reason::Generic, net.ledger(5).hash(), 2);
    assert_eq!(net.replayer.task_count(), 2);

    net.replayer.sweep();

    assert_eq!(net.replayer.task_count(), 1);
    assert_eq!(net.replayer.tasks()[0].hash(), net.ledger(5).hash());
    assert_eq!(net.replayer.skip_list_count(), 1);
    assert_eq!(net.replayer.delta_count(), 0);

    Ok(())
}

#[test]
fn stop_cancels_everything() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    net.give_client(10);

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 11);
    let task = net.replayer.tasks()[0].clone();
    for request in net.take_requests() {
        net.answer(request);
    }
    assert_eq!(task.status(), TaskStatus::BuildingDeltas);

    net.replayer.stop();

    assert!(net.replayer.is_stopping());
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(net.replayer.task_count(), 0);
    assert_eq!(net.replayer.skip_list_count(), 0);
    assert_eq!(net.replayer.delta_count(), 0);

    // Late responses and timers are ignored.
    net.run();
    net.client.jobs.tick();
    assert_eq!(net.client.builder.build_count(), 0);
    assert!(net.client.jobs.timer_delays().is_empty());

    net.replayer.replay(Reason::Generic, net.ledger(20).hash(), 11);
    assert_eq!(net.replayer.task_count(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sweeper_runs_until_stopped() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(8, &[(1, true)]);
    for seq in 4..=8 {
        net.give_client(seq);
    }

    net.replayer.replay(Reason::Generic, net.ledger(8).hash(), 5);
    assert_eq!(net.replayer.task_count(), 1);

    let sweeper = net.replayer.spawn_sweeper();
    tokio::time::sleep(net.replayer.config().sweep_interval + Duration::from_secs(1)).await;
    assert_eq!(net.replayer.task_count(), 0);

    net.replayer.stop();
    sweeper.await?;

    Ok(())
}

#[test]
fn skip_list_requests_are_answered_from_local_ledgers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(6, &[]);
    let ledger = net.ledger(5);

    let response = net.server_handler.process_skip_list_request(ledger.hash());
    assert_eq!(response.error, None);
    assert_eq!(response.header.as_ref(), Some(ledger.header()));
    assert_eq!(decode_skip_list(&response.item)?, ledger.skip_list());

    let response = net.server_handler.process_skip_list_request(Hash([7; 32]));
    assert_eq!(response.error, Some(ReplyError::NoLedger));

    // The first ledger has no ancestors.
    let response = net.server_handler.process_skip_list_request(net.ledger(1).hash());
    assert_eq!(response.error, Some(ReplyError::NoNode));

    let disabled = ReplayMsgHandler::new(
        &Config::default(),
        net.server.store.clone(),
        net.replayer.clone(),
    );
    let response = disabled.process_skip_list_request(ledger.hash());
    assert_eq!(response.error, Some(ReplyError::Disabled));
    let response = disabled.process_replay_delta_request(ledger.hash());
    assert_eq!(response.error, Some(ReplyError::Disabled));

    Ok(())
}

#[test]
fn replay_delta_requests_are_answered_from_local_ledgers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(8, &[]);
    let ledger = net.ledger(7);
    assert_eq!(ledger.transactions().len(), 3);

    let response = net.server_handler.process_replay_delta_request(ledger.hash());
    assert_eq!(response.error, None);
    assert_eq!(response.header.as_ref(), Some(ledger.header()));
    assert_eq!(
        response
            .transactions
            .iter()
            .map(|(index, _)| *index)
            .collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let response = net.server_handler.process_replay_delta_request(Hash([7; 32]));
    assert_eq!(response.error, Some(ReplyError::NoLedger));

    Ok(())
}

#[test]
fn invalid_skip_list_responses_are_rejected() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(8, &[]);
    let valid = net.server_handler.process_skip_list_request(net.ledger(5).hash());
    assert_eq!(net.client_handler.process_skip_list_response(valid.clone()), Ok(()));

    let response = SkipListResponse::error(net.ledger(5).hash(), ReplyError::NoLedger);
    assert_eq!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::Peer(ReplyError::NoLedger))
    );

    let response = SkipListResponse {
        header: None,
        ..valid.clone()
    };
    assert_eq!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::MissingHeader)
    );

    let response = SkipListResponse {
        ledger_hash: net.ledger(6).hash(),
        ..valid.clone()
    };
    assert_eq!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::WrongLedger {
            requested: net.ledger(6).hash(),
            actual: net.ledger(5).hash(),
        })
    );

    let response = SkipListResponse {
        item: encode_skip_list(net.ledger(4).skip_list()),
        ..valid.clone()
    };
    assert_eq!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::SkipListMismatch)
    );

    let response = SkipListResponse {
        item: vec![1, 2],
        ..valid
    };
    assert!(matches!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::Serialization(_))
    ));

    Ok(())
}

#[test]
fn skip_lists_must_match_the_header() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(20, &[(1, true)]);
    let ledger = net.ledger(20);
    assert_eq!(ledger.header().skip_list_hash, skip_list_hash(ledger.skip_list()));

    net.replayer.replay(Reason::Generic, ledger.hash(), 5);
    let skip_list = net.replayer.skip_list(ledger.hash()).expect("live skip list");
    net.take_requests();

    // Made-up ancestors, ending with the real parent.
    let valid = net.server_handler.process_skip_list_request(ledger.hash());
    let mut forged: Vec<Hash> = (1..=18).map(|i| Hash([i; 32])).collect();
    forged.push(net.ledger(19).hash());
    assert_eq!(forged.len(), ledger.skip_list().len());

    let response = SkipListResponse {
        item: encode_skip_list(&forged),
        ..valid.clone()
    };
    assert_eq!(
        net.client_handler.process_skip_list_response(response),
        Err(ResponseError::SkipListMismatch)
    );
    assert_eq!(skip_list.status(), AcquireStatus::Pending);
    assert_eq!(net.replayer.tasks()[0].status(), TaskStatus::AcquiringSkipList);

    assert_eq!(net.client_handler.process_skip_list_response(valid), Ok(()));
    assert_eq!(skip_list.status(), AcquireStatus::Complete);

    Ok(())
}

#[test]
fn broadcasts_only_reach_connected_peers() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(4, &[(1, true), (2, true), (3, false)]);
    let peers = net.overlay.mock_peers();

    let peer_set = OverlayPeerSet::new(net.overlay.clone());
    let mut added = Vec::new();
    peer_set.add_peers(5, &|_| true, &mut |peer| added.push(peer.id()));
    added.sort_unstable();
    assert_eq!(added, vec![1, 2, 3]);

    net.overlay.disconnect(2);

    let request = Request::SkipList {
        ledger_hash: net.ledger(4).hash(),
    };
    peer_set.send_request(request.clone(), None);

    let sent: Vec<_> = peers.iter().map(|peer| (peer.id(), peer.sent_count())).collect();
    assert_eq!(sent, vec![(1, 1), (2, 0), (3, 1)]);
    assert_eq!(peers[0].take_sent(), vec![request]);

    // Disconnected peers stay in the set, so they aren't added again.
    let mut added_again = 0;
    peer_set.add_peers(5, &|_| true, &mut |_| added_again += 1);
    assert_eq!(added_again, 0);
    assert_eq!(peer_set.added_peer_count(), 3);

    Ok(())
}

#[test]
fn invalid_replay_delta_responses_are_rejected() -> Result<()> {
    ledger_replay_test::init();

    let net = TestNetwork::new(8, &[]);
    let valid = net.server_handler.process_replay_delta_request(net.ledger(7).hash());
    assert_eq!(net.client_handler.process_replay_delta_response(valid.clone()), Ok(()));

    let response = ReplayDeltaResponse::error(net.ledger(7).hash(), ReplyError::BadRequest);
    assert_eq!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::Peer(ReplyError::BadRequest))
    );

    let response = ReplayDeltaResponse {
        header: None,
        ..valid.clone()
    };
    assert_eq!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::MissingHeader)
    );

    let response = ReplayDeltaResponse {
        ledger_hash: net.ledger(6).hash(),
        ..valid.clone()
    };
    assert!(matches!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::WrongLedger { .. })
    ));

    let mut response = valid.clone();
    response.transactions.push((0, Transaction::new(vec![0xff])));
    assert_eq!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::DuplicateIndex(0))
    );

    let mut response = valid.clone();
    response.transactions.pop();
    assert_eq!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::TxRootMismatch)
    );

    // Reordering valid transactions changes the root.
    let mut response = valid;
    let (first, second) = (response.transactions[0].1.clone(), response.transactions[1].1.clone());
    response.transactions[0].1 = second;
    response.transactions[1].1 = first;
    assert_eq!(
        net.client_handler.process_replay_delta_response(response),
        Err(ResponseError::TxRootMismatch)
    );

    Ok(())
}

#[test]
fn skip_list_items_reject_bad_lengths() -> Result<()> {
    ledger_replay_test::init();

    let hashes = vec![Hash([1; 32]), Hash([2; 32])];
    let item = encode_skip_list(&hashes);
    assert_eq!(item.len(), 4 + 64);
    assert_eq!(decode_skip_list(&item)?, hashes);

    assert_eq!(
        decode_skip_list(&item[..2]),
        Err(SerializationError::Parse("skip list item is missing its count"))
    );
    assert!(decode_skip_list(&item[..item.len() - 1]).is_err());

    let mut trailing = item.clone();
    trailing.push(0);
    assert!(decode_skip_list(&trailing).is_err());

    let mut too_long = 257u32.to_le_bytes().to_vec();
    too_long.extend(std::iter::repeat(0).take(257 * 32));
    assert!(decode_skip_list(&too_long).is_err());

    Ok(())
}

#[test]
fn hashes_display_as_hex() -> Result<()> {
    ledger_replay_test::init();

    let hash = Hash([0xab; 32]);
    let text = hash.to_string();
    assert_eq!(text, "ab".repeat(32));
    assert_eq!(text.parse::<Hash>()?, hash);
    assert!("not hex".parse::<Hash>().is_err());
    assert_eq!(format!("{hash:?}"), format!("Hash(\"{text}\")"));

    Ok(())
}

#[test]
fn config_parses_durations_and_rejects_unknown_fields() -> Result<()> {
    ledger_replay_test::init();

    let config: Config = toml::from_str(
        r#"
        enable = true
        task_timeout = "2s"
        sub_task_fallback_timeout = "1500ms"
        max_tasks = 3
        "#,
    )?;

    assert!(config.enable);
    assert_eq!(config.task_timeout, Duration::from_secs(2));
    assert_eq!(config.sub_task_fallback_timeout, Duration::from_millis(1500));
    assert_eq!(config.max_tasks, 3);
    assert_eq!(config.sub_task_timeout, Duration::from_millis(250));
    assert_eq!(config.max_task_size, 256);

    let config: Config = toml::from_str("")?;
    assert_eq!(config, Config::default());
    assert!(!config.enable);

    assert!(toml::from_str::<Config>("max_peers = 3").is_err());

    Ok(())
}
