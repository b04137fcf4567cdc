use std::time::Duration;

use crate::admission::Admission;
use crate::comm::{Operation, StageInOutcome};
use crate::common::error::CoreError;
use crate::engine::Policy;
use crate::reactor::{purge_job, stage_in_status, stage_out_status};
use crate::request::{BufferState, StageInStatus, StageOutStatus};
use crate::tests::utils::env::{TestEnv, test_policy};
use crate::tests::utils::job::JobBuilder;
use crate::{GroupId, JobId, UserId};

#[test]
fn test_admit_rounds_to_granularity() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).capacity(250).build();
    assert_eq!(env.admit(&job), Admission::Started);
    assert_eq!(env.used("default"), 300);
    assert_eq!(env.state(1), BufferState::StagingIn);

    let ops = env.comm.take_operations(1);
    assert_eq!(
        ops[0],
        Operation::StageIn {
            job_id: 1.into(),
            user_id: UserId::new(1000),
            group_id: GroupId::new(100),
            pool: "default".to_string(),
            size: 300,
        }
    );
    env.comm.emptiness_check();
}

#[test]
fn test_deferred_until_space_released() {
    let mut env = TestEnv::new();
    let a = JobBuilder::new(1).capacity(250).build();
    env.staged_in(&a);

    let b = JobBuilder::new(2).capacity(800).build();
    assert!(matches!(env.admit(&b), Admission::Deferred { .. }));
    assert_eq!(env.state(2), BufferState::Pending);
    env.comm.emptiness_check();

    env.run_to_completion(1);
    assert_eq!(env.used("default"), 0);
    assert!(env.core().registry().is_empty());

    assert_eq!(env.admit(&b), Admission::Started);
    assert_eq!(env.used("default"), 800);
}

#[test]
fn test_preempt_later_reservation() {
    let mut env = TestEnv::new();
    let d = JobBuilder::new(4)
        .capacity(500)
        .priority(1)
        .start_at(env.at(3600))
        .build();
    env.staged_in(&d);

    let c = JobBuilder::new(3).capacity(900).priority(10).build();
    assert_eq!(env.admit(&c), Admission::Started);
    let ops = env.comm.take_operations(2);
    assert_eq!(
        ops[0],
        Operation::Teardown {
            job_id: 4.into(),
            hurry: true,
            delay: Duration::ZERO,
        }
    );
    assert!(matches!(&ops[1], Operation::StageIn { job_id, size: 900, .. } if *job_id == JobId::new(3)));
    assert_eq!(env.used("default"), 900);
    assert_eq!(env.state(4), BufferState::Teardown);

    env.finish(&ops[0], Ok(()));
    assert_eq!(env.state(4), BufferState::Pending);
    assert_eq!(env.used("default"), 900);
    env.comm.emptiness_check();

    // The preempted job asks again but the space is taken
    assert!(matches!(env.admit(&d), Admission::Deferred { .. }));
}

#[test]
fn test_stage_in_failure_tears_down() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).capacity(100).build();
    env.admit(&job);
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("exit code 1: insufficient space".to_string()));

    assert_eq!(env.state(1), BufferState::Teardown);
    let holds = env.comm.take_holds(1);
    assert_eq!(holds[0].0, JobId::new(1));
    assert!(holds[0].1.contains("stage-in"));
    assert!(holds[0].1.contains("insufficient space"));

    let op = env.comm.take_operations(1).pop().unwrap();
    assert_eq!(
        op,
        Operation::Teardown {
            job_id: 1.into(),
            hurry: true,
            delay: Duration::ZERO,
        }
    );
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(env.used("default"), 0);
    assert_eq!(
        stage_in_status(env.core(), 1.into()),
        StageInStatus::Failed
    );
    env.comm.emptiness_check();
}

#[test]
fn test_persistent_create_is_idempotent_for_owner() {
    let mut env = TestEnv::new();
    env.core().set_policy(Policy {
        enable_persistent: true,
        ..test_policy()
    });

    let job1 = JobBuilder::new(1).create("X", 250).build();
    assert_eq!(env.admit(&job1), Admission::Started);
    assert_eq!(env.state(1), BufferState::Allocating);
    let ops = env.comm.take_operations(1);
    assert!(matches!(&ops[0], Operation::CreatePersistent { name, size: 300, .. } if name == "X"));
    env.finish(&ops[0], Ok(()));
    assert_eq!(env.state(1), BufferState::StagedIn);
    let allocation = env.core().registry().get("X").unwrap();
    assert!(allocation.is_persistent());
    assert_eq!(allocation.user_id, UserId::new(1000));
    assert_eq!(env.used("default"), 300);

    let job2 = JobBuilder::new(2).create("X", 250).build();
    assert_eq!(env.admit(&job2), Admission::Started);
    env.comm.emptiness_check();
    assert_eq!(env.state(2), BufferState::StagedIn);
    assert_eq!(env.used("default"), 300);

    let job3 = JobBuilder::new(3).user(2000).create("X", 250).build();
    let Admission::Rejected { reason } = env.admit(&job3) else {
        panic!("create of foreign buffer was not rejected");
    };
    assert!(reason.contains("owned by user 1000"));
    let holds = env.comm.take_holds(1);
    assert_eq!(holds[0].0, JobId::new(3));
}

#[test]
fn test_persistent_only_job_has_no_session() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).create("scratch", 100).build();
    env.staged_in(&job);
    env.begin(1).unwrap();
    env.comm.emptiness_check();
    assert_eq!(env.state(1), BufferState::Running);
    env.stage_out(1);
    env.comm.emptiness_check();
    assert_eq!(env.state(1), BufferState::Complete);
    // The persistent buffer outlives the job
    assert_eq!(env.used("default"), 100);
}

#[test]
fn test_persistent_destroy() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).create("X", 200).build());
    assert_eq!(env.used("default"), 200);

    let job = JobBuilder::new(2).destroy("X").build();
    assert_eq!(env.admit(&job), Admission::Started);
    let op = env.comm.take_operations(1).pop().unwrap();
    assert!(matches!(&op, Operation::DestroyPersistent { name, hurry: false, .. } if name == "X"));
    env.finish(&op, Ok(()));
    assert_eq!(env.state(2), BufferState::StagedIn);
    assert!(env.core().registry().get("X").is_none());
    assert_eq!(env.used("default"), 0);

    // Nothing left to destroy
    let job = JobBuilder::new(3).destroy("X").build();
    assert_eq!(env.admit(&job), Admission::Started);
    env.comm.emptiness_check();
}

#[test]
fn test_persistent_create_failure_returns_to_pending() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).capacity(100).create("X", 200).build();
    env.admit(&job);
    assert_eq!(env.used("default"), 300);
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("quota exceeded".to_string()));

    assert_eq!(env.state(1), BufferState::Pending);
    assert_eq!(env.used("default"), 0);
    let holds = env.comm.take_holds(1);
    assert!(holds[0].1.contains("create-persistent X: quota exceeded"));
    env.comm.emptiness_check();
}

#[test]
fn test_concurrent_create_of_same_persistent_waits() {
    let mut env = TestEnv::new();
    let job1 = JobBuilder::new(1).create("X", 250).build();
    assert_eq!(env.admit(&job1), Admission::Started);
    let op = env.comm.take_operations(1).pop().unwrap();

    let job2 = JobBuilder::new(2).create("X", 250).build();
    let Admission::Deferred { reason, .. } = env.admit(&job2) else {
        panic!("second create was not deferred");
    };
    assert!(reason.contains("being changed by job 1"));
    env.comm.emptiness_check();
    assert_eq!(env.used("default"), 300);

    env.finish(&op, Ok(()));
    let allocation = env.core().registry().get("X").unwrap();
    assert_eq!(allocation.size, 300);
    assert_eq!(allocation.pool, "default");
    assert_eq!(env.used("default"), 300);

    assert_eq!(env.admit(&job2), Admission::Started);
    env.comm.emptiness_check();
    assert_eq!(env.state(2), BufferState::StagedIn);
    assert_eq!(env.used("default"), 300);
}

#[test]
fn test_failed_create_keeps_charge_of_other_job() {
    let mut env = TestEnv::new();
    let job1 = JobBuilder::new(1).create("Y", 100).create("X", 250).build();
    assert_eq!(env.admit(&job1), Admission::Started);
    let op_y = env.comm.take_operations(1).pop().unwrap();

    // X is not in flight yet, so the second job may create it
    let job2 = JobBuilder::new(2).create("X", 250).build();
    assert_eq!(env.admit(&job2), Admission::Started);
    let op_x = env.comm.take_operations(1).pop().unwrap();
    assert!(matches!(&op_x, Operation::CreatePersistent { job_id, .. } if *job_id == JobId::new(2)));
    assert_eq!(env.used("default"), 400);

    // The first job reaches X while the second one creates it
    env.finish(&op_y, Ok(()));
    env.comm.emptiness_check();
    assert_eq!(env.state(1), BufferState::Pending);
    assert_eq!(env.used("default"), 400);
    assert!(matches!(env.admit(&job1), Admission::Deferred { .. }));

    env.finish(&op_x, Err("quota exceeded".to_string()));
    env.comm.take_holds(1);
    assert_eq!(env.state(2), BufferState::Pending);
    assert_eq!(env.used("default"), 100);

    assert_eq!(env.admit(&job1), Admission::Started);
    let op = env.comm.take_operations(1).pop().unwrap();
    assert!(matches!(&op, Operation::CreatePersistent { job_id, size: 300, .. } if *job_id == JobId::new(1)));
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::StagedIn);
    assert_eq!(env.core().registry().get("X").unwrap().size, 300);
    assert_eq!(env.used("default"), 400);
}

#[test]
fn test_use_of_persistent_needs_session() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).create("X", 200).build());
    let job = JobBuilder::new(2).use_buffer("X").build();
    assert_eq!(env.admit(&job), Admission::Started);
    let op = env.comm.take_operations(1).pop().unwrap();
    assert!(matches!(op, Operation::StageIn { size: 0, .. }));
}

#[test]
fn test_empty_request_completes_immediately() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).build();
    assert_eq!(env.admit(&job), Admission::Started);
    assert_eq!(env.state(1), BufferState::Complete);
    assert!(env.begin(1).is_ok());
    env.stage_out(1);
    env.comm.emptiness_check();
    assert_eq!(env.comm.take_saves(), 0);
}

#[test]
fn test_swap_is_charged() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).swap(50, 3).build();
    assert_eq!(env.admit(&job), Admission::Started);
    assert_eq!(env.used("default"), 200);
}

#[test]
fn test_teardown_twice() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(300).build());
    assert_eq!(env.core().registry().len(), 1);

    env.request_teardown(1, false);
    env.request_teardown(1, true);
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(env.used("default"), 0);
    assert!(env.core().registry().is_empty());

    // Late duplicate result and request change nothing
    env.finish(&op, Ok(()));
    env.request_teardown(1, false);
    env.comm.emptiness_check();
    assert_eq!(env.used("default"), 0);
}

#[test]
fn test_teardown_failure_retried_after_cooldown() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(300).build());
    env.request_teardown(1, false);
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("permission denied".to_string()));

    assert_eq!(env.state(1), BufferState::TeardownFail);
    let holds = env.comm.take_holds(1);
    assert_eq!(holds[0].1, "teardown: permission denied");
    let op = env.comm.take_operations(1).pop().unwrap();
    assert_eq!(
        op,
        Operation::Teardown {
            job_id: 1.into(),
            hurry: true,
            delay: Duration::from_secs(10),
        }
    );
    assert_eq!(env.used("default"), 300);

    env.advance(10);
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(env.used("default"), 0);
}

#[test]
fn test_benign_teardown_error() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(300).build());
    env.request_teardown(1, false);
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("teardown: token not found".to_string()));
    assert_eq!(env.state(1), BufferState::Complete);
    env.comm.emptiness_check();
}

#[test]
fn test_cancel_pending() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(800).build());
    let job = JobBuilder::new(2).capacity(800).build();
    assert!(matches!(env.admit(&job), Admission::Deferred { .. }));
    env.cancel(2);
    assert_eq!(env.state(2), BufferState::Complete);
    env.comm.emptiness_check();
    assert!(matches!(env.admit(&job), Admission::Rejected { .. }));
}

#[test]
fn test_cancel_during_stage_in() {
    let mut env = TestEnv::new();
    env.admit(&JobBuilder::new(1).capacity(300).build());
    let op = env.comm.take_operations(1).pop().unwrap();
    env.cancel(1);
    env.comm.emptiness_check();

    env.finish(&op, Ok(()));
    let op = env.comm.take_operations(1).pop().unwrap();
    assert!(matches!(op, Operation::Teardown { hurry: true, .. }));
    assert_eq!(env.state(1), BufferState::Teardown);
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(env.used("default"), 0);
    env.comm.emptiness_check();
}

#[test]
fn test_stage_in_size_correction() {
    let mut env = TestEnv::new();
    env.admit(&JobBuilder::new(1).capacity(250).build());
    env.comm.take_operations(1);
    env.stage_in_finished(
        1,
        StageInOutcome::Finished {
            real_size: Some(400),
        },
    );
    assert_eq!(env.state(1), BufferState::StagedIn);
    assert_eq!(env.used("default"), 400);
    assert_eq!(env.core().registry().get("1").unwrap().size, 400);
}

#[test]
fn test_pre_run_failure_escalates_to_kill() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).capacity(100).build();
    env.staged_in(&job);
    env.begin(1).unwrap();
    let op = env.comm.take_operations(1).pop().unwrap();
    assert_eq!(op, Operation::PreRun { job_id: 1.into() });
    env.finish(&op, Err("node failure".to_string()));
    let holds = env.comm.take_holds(1);
    assert_eq!(holds[0].1, "pre-run: node failure");
    env.comm.take_kills(0);
    env.finish_next();
    assert_eq!(env.state(1), BufferState::Complete);

    env.staged_in(&job);
    env.begin(1).unwrap();
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("node failure".to_string()));
    let kills = env.comm.take_kills(1);
    assert_eq!(kills[0].0, JobId::new(1));
    env.comm.take_holds(0);
    env.finish_next();
    assert_eq!(env.state(1), BufferState::Complete);
}

#[test]
fn test_revoke_before_pre_run_finishes() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(100).build());
    env.begin(1).unwrap();
    let op = env.comm.take_operations(1).pop().unwrap();
    env.revoke(1).unwrap();
    assert_eq!(env.state(1), BufferState::AllocRevoke);
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::StagedIn);

    // Placed again later
    env.begin(1).unwrap();
    assert_eq!(env.state(1), BufferState::PreRun);
    env.finish_next();
    assert_eq!(env.state(1), BufferState::Running);
}

#[test]
fn test_revoke_then_begin_again() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(100).build());
    env.begin(1).unwrap();
    let op = env.comm.take_operations(1).pop().unwrap();
    env.revoke(1).unwrap();
    env.begin(1).unwrap();
    env.comm.emptiness_check();
    env.finish(&op, Ok(()));
    assert_eq!(env.state(1), BufferState::Running);
}

#[test]
fn test_stage_out_during_pre_run() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(100).build());
    env.begin(1).unwrap();
    let pre_run = env.comm.take_operations(1).pop().unwrap();
    env.stage_out(1);
    env.comm.emptiness_check();
    assert_eq!(env.state(1), BufferState::PostRun);
    env.finish(&pre_run, Ok(()));
    let op = env.comm.take_operations(1).pop().unwrap();
    assert_eq!(op, Operation::PostRun { job_id: 1.into() });
}

#[test]
fn test_stage_out_failure() {
    let mut env = TestEnv::new();
    env.staged_in(&JobBuilder::new(1).capacity(100).build());
    env.begin(1).unwrap();
    env.finish_next();
    env.stage_out(1);
    env.finish_next();
    assert_eq!(env.state(1), BufferState::StagingOut);
    assert_eq!(
        stage_out_status(env.core(), 1.into()),
        StageOutStatus::InProgress
    );
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("copy failed".to_string()));
    assert_eq!(env.comm.take_holds(1)[0].1, "stage-out: copy failed");
    env.finish_next();
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(
        stage_out_status(env.core(), 1.into()),
        StageOutStatus::Failed
    );
}

#[test]
fn test_failed_stage_out_kept_until_cancel() {
    let mut env = TestEnv::new();
    env.core().set_policy(Policy {
        keep_failed_stage_out: true,
        ..test_policy()
    });
    env.staged_in(&JobBuilder::new(1).capacity(100).build());
    env.begin(1).unwrap();
    env.finish_next();
    env.stage_out(1);
    env.finish_next();
    let op = env.comm.take_operations(1).pop().unwrap();
    env.finish(&op, Err("copy failed".to_string()));
    env.comm.take_holds(1);
    env.comm.emptiness_check();
    assert_eq!(env.state(1), BufferState::StagingOut);
    assert_eq!(env.used("default"), 100);

    env.cancel(1);
    assert!(matches!(
        env.finish_next(),
        Operation::Teardown { hurry: true, .. }
    ));
    assert_eq!(env.state(1), BufferState::Complete);
    assert_eq!(env.used("default"), 0);
}

#[test]
fn test_begin_requires_staged_in() {
    let mut env = TestEnv::new();
    let job = JobBuilder::new(1).capacity(5000).build();
    assert!(matches!(env.admit(&job), Admission::Rejected { .. }));
    env.comm.take_holds(1);
    assert!(matches!(
        env.begin(1),
        Err(CoreError::InvalidState {
            state: BufferState::Pending,
            ..
        })
    ));
    assert!(matches!(env.begin(7), Err(CoreError::UnknownJob(_))));
}

#[test]
fn test_status_and_purge() {
    let mut env = TestEnv::new();
    assert_eq!(
        stage_in_status(env.core(), 1.into()),
        StageInStatus::NotStarted
    );
    let job = JobBuilder::new(1).capacity(100).build();
    env.admit(&job);
    assert_eq!(
        stage_in_status(env.core(), 1.into()),
        StageInStatus::InProgress
    );
    env.finish_next();
    assert_eq!(stage_in_status(env.core(), 1.into()), StageInStatus::Ready);
    assert!(purge_job(env.core(), 1.into()).is_err());

    env.run_to_completion(1);
    assert_eq!(
        stage_out_status(env.core(), 1.into()),
        StageOutStatus::Complete
    );
    purge_job(env.core(), 1.into()).unwrap();
    assert!(env.core().get_job(1.into()).is_none());
}

#[test]
fn test_random_lifecycles_keep_invariants() {
    let mut env = TestEnv::new();
    let mut outstanding: Vec<Operation> = Vec::new();
    let mut seed = 42u64;
    let mut next = move || {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        seed >> 33
    };

    for step in 0..5000 {
        let job_id = JobId::new((next() % 6 + 1) as u32);
        match next() % 8 {
            0 | 1 => {
                let job = JobBuilder::new(job_id)
                    .capacity(next() % 600)
                    .priority((next() % 5) as u32)
                    .start_at(env.at((next() % 100) as i64))
                    .build();
                env.admit(&job);
            }
            2 => {
                let _ = env.begin(job_id);
            }
            3 => env.stage_out(job_id),
            4 => env.cancel(job_id),
            5 => env.request_teardown(job_id, next() % 2 == 0),
            _ => {
                if !outstanding.is_empty() {
                    let idx = next() as usize % outstanding.len();
                    let op = outstanding.swap_remove(idx);
                    let result = if next() % 4 == 0 {
                        Err("tool failed".to_string())
                    } else {
                        Ok(())
                    };
                    env.finish(&op, result);
                }
            }
        }
        outstanding.append(&mut env.comm.operations);
        env.comm.holds.clear();
        env.comm.kills.clear();

        let mut ids: Vec<JobId> = outstanding.iter().map(|op| op.job_id()).collect();
        ids.sort_unstable();
        let count = ids.len();
        ids.dedup();
        assert_eq!(count, ids.len(), "step {step}: {outstanding:?}");

        let pool = env.core().ledger().pool("default").unwrap();
        assert!(pool.used() <= pool.total);
        env.advance(1);
    }
}
