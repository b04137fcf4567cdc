use std::time::Duration;

use bbcore::reconcile::{JobLiveness, purge_vestigial};
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::JobId;
use crate::controller::scheduler::SchedulerJobState;
use crate::controller::{Controller, recovery};
use crate::tool::query::{query_pools, query_sessions};
use crate::tool::response::PoolUpdate;

fn apply_pools(controller: &Controller, pools: Vec<PoolUpdate>) {
    let mut core = controller.inner.core.lock();
    for pool in pools {
        log::debug!(
            "Pool {}: granularity {}, total {}, used {}",
            pool.name,
            pool.granularity,
            pool.total,
            pool.used
        );
        core.ledger_mut()
            .update_pool(&pool.name, pool.granularity, pool.total, pool.used);
    }
}

pub(super) async fn refresh(controller: &Controller, initial: bool) -> crate::Result<()> {
    let executor = controller.inner.executor.clone();
    let timeout = controller.inner.config.read().timeouts.other;

    match query_pools(executor.as_ref(), timeout).await {
        Ok(pools) => apply_pools(controller, pools),
        Err(error) if initial => log::warn!("Cannot load pools: {error:#}"),
        Err(error) => return Err(error.into()),
    }

    let now = Utc::now();
    let sessions = query_sessions(executor.as_ref(), timeout, now).await;
    if initial {
        let sessions = match sessions {
            Ok(sessions) => Some(sessions),
            Err(error) => {
                log::warn!("Cannot load sessions: {error:#}");
                None
            }
        };
        return recovery::recover_state(controller, sessions);
    }

    let sessions = sessions?;
    let purged = controller.with_locks(|core, comm, table| {
        let liveness = |job_id: JobId| match table.job_state(job_id) {
            Some(SchedulerJobState::Pending | SchedulerJobState::Running) => JobLiveness::Active,
            Some(SchedulerJobState::Finished) | None => JobLiveness::Finished,
        };
        purge_vestigial(core, comm, &sessions, liveness, now)
    });
    if purged > 0 {
        log::info!("Purged {purged} vestigial allocation(s)");
    }
    Ok(())
}

pub(super) async fn refresh_process(controller: Controller, period: Duration, stop: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(error) = controller.periodic_refresh(false).await {
            log::error!("Burst buffer refresh failed: {error}");
        }
    }
    log::debug!("Refresh process stopped");
}
