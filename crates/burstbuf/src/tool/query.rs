//! Read-only queries of the storage system state.

use std::time::Duration;

use anyhow::Context;
use bbcore::Timestamp;
use bbcore::reconcile::LiveSession;
use serde::de::DeserializeOwned;

use crate::tool::response::{
    ConfigurationsResponse, InstancesResponse, PoolUpdate, PoolsResponse, SessionsResponse,
    live_sessions, parse, pool_updates,
};
use crate::tool::{ToolExecutor, ToolResult, args, run_tool};

async fn query<T: DeserializeOwned>(
    executor: &dyn ToolExecutor,
    function: &str,
    timeout: Duration,
) -> ToolResult<T> {
    let output = run_tool(executor, args::query(function), timeout)
        .await
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("{function} query failed"))?;
    parse(function, &output)
}

pub async fn query_pools(executor: &dyn ToolExecutor, timeout: Duration) -> ToolResult<Vec<PoolUpdate>> {
    let response: PoolsResponse = query(executor, args::POOLS, timeout).await?;
    Ok(pool_updates(response))
}

pub async fn query_sessions(
    executor: &dyn ToolExecutor,
    timeout: Duration,
    now: Timestamp,
) -> ToolResult<Vec<LiveSession>> {
    let (sessions, instances) = futures::try_join!(
        query::<SessionsResponse>(executor, args::SHOW_SESSIONS, timeout),
        query::<InstancesResponse>(executor, args::SHOW_INSTANCES, timeout),
    )?;
    Ok(live_sessions(sessions, instances, now))
}

pub async fn query_configurations(
    executor: &dyn ToolExecutor,
    timeout: Duration,
) -> ToolResult<ConfigurationsResponse> {
    query(executor, args::SHOW_CONFIGURATIONS, timeout).await
}
