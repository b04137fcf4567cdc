use bbcore::reconcile::{LiveSession, recover};
use bbcore::registry::Allocation;
use chrono::Utc;

use crate::config::BbFlags;
use crate::controller::Controller;
use crate::persist::{StateFile, read_state};

/// Stands in for the session list when the storage system cannot be asked;
/// every recorded allocation is assumed to exist.
fn assumed_sessions(allocations: &[Allocation]) -> Vec<LiveSession> {
    allocations
        .iter()
        .map(|allocation| LiveSession {
            name: allocation.name.clone(),
            user_id: allocation.user_id,
            created: allocation.create_time,
            size: (allocation.size > 0).then_some(allocation.size),
            pool: Some(allocation.pool.clone()),
        })
        .collect()
}

fn load_state(controller: &Controller) -> crate::Result<StateFile> {
    let (path, flags) = {
        let config = controller.inner.config.read();
        (config.state_file(), config.flags)
    };
    let state = match read_state(&path) {
        Ok(Some(state)) => state,
        Ok(None) => {
            log::info!("No state file found in {}, starting empty", path.display());
            StateFile {
                emulated: flags.contains(BbFlags::EMULATE),
                allocations: Vec::new(),
            }
        }
        Err(error) if flags.contains(BbFlags::BEST_EFFORT_RECOVERY) => {
            log::error!("{error}; continuing without recorded allocations");
            StateFile::default()
        }
        Err(error) => return Err(error),
    };
    if state.emulated != flags.contains(BbFlags::EMULATE) && !state.allocations.is_empty() {
        log::warn!(
            "State file {} was written with emulation {}, sizes are taken from the storage system",
            path.display(),
            if state.emulated { "on" } else { "off" }
        );
    }
    Ok(state)
}

/// Rebuilds the registry from the state file and the storage system.
pub(super) fn recover_state(
    controller: &Controller,
    sessions: Option<Vec<LiveSession>>,
) -> crate::Result<()> {
    let state = load_state(controller)?;
    let now = Utc::now();
    let allocations: Vec<Allocation> = state
        .allocations
        .into_iter()
        .map(|stored| stored.into_allocation(now))
        .collect();
    let sessions = sessions.unwrap_or_else(|| {
        log::warn!(
            "Assuming that all {} recorded allocation(s) still exist",
            allocations.len()
        );
        assumed_sessions(&allocations)
    });

    let summary = controller.with_locks(|core, comm, table| {
        let jobs = table.buffered_jobs();
        recover(
            core,
            comm,
            allocations,
            &sessions,
            &jobs,
            |user_id| table.user_defaults(user_id),
            now,
        )
    });
    log::info!(
        "Recovered burst buffer state: {} adopted, {} unexpected, {} discarded, {} vanished, {} job(s) resumed",
        summary.adopted,
        summary.unexpected,
        summary.discarded,
        summary.vanished,
        summary.resumed
    );
    Ok(())
}
