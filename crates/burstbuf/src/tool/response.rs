//! Typed forms of the JSON documents printed by the provisioning tool.
//! Unknown fields are ignored, missing ones are decode errors.

use anyhow::Context;
use bbcore::reconcile::LiveSession;
use bbcore::{Map, Timestamp, UserId};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::common::utils::time::from_unix_seconds;

#[derive(Debug, Deserialize)]
pub struct PoolsResponse {
    pub pools: Vec<PoolRecord>,
}

#[derive(Debug, Deserialize)]
pub struct PoolRecord {
    pub id: String,
    pub units: String,
    /// Size of one allocation unit in bytes
    pub granularity: u64,
    /// Number of allocation units
    pub quantity: u64,
    /// Number of free allocation units
    pub free: u64,
}

#[derive(Debug, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub token: String,
    pub created: i64,
    pub owner: u32,
}

#[derive(Debug, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
pub struct InstanceRecord {
    pub id: u64,
    pub capacity: InstanceCapacity,
    pub links: InstanceLinks,
}

#[derive(Debug, Deserialize)]
pub struct InstanceCapacity {
    pub bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct InstanceLinks {
    pub session: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationsResponse {
    pub configurations: Vec<ConfigurationRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationRecord {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub links: ConfigurationLinks,
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationLinks {
    pub instance: u64,
}

#[derive(Debug, Deserialize)]
pub struct RealSizeResponse {
    pub capacity: u64,
    pub units: String,
}

pub fn parse<T: DeserializeOwned>(function: &str, output: &str) -> anyhow::Result<T> {
    serde_json::from_str(output).with_context(|| format!("Cannot parse output of {function}"))
}

/// Pool state in bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolUpdate {
    pub name: String,
    pub granularity: u64,
    pub total: u64,
    pub used: u64,
}

/// Converts pool records; pools not measured in bytes cannot be charged and are skipped.
pub fn pool_updates(response: PoolsResponse) -> Vec<PoolUpdate> {
    response
        .pools
        .into_iter()
        .filter_map(|pool| {
            if pool.units != "bytes" {
                log::debug!("Ignoring pool {} measured in {}", pool.id, pool.units);
                return None;
            }
            let total = pool.quantity.saturating_mul(pool.granularity);
            let free = pool.free.min(pool.quantity).saturating_mul(pool.granularity);
            Some(PoolUpdate {
                name: pool.id,
                granularity: pool.granularity,
                total,
                used: total - free,
            })
        })
        .collect()
}

/// Joins sessions with the capacity of their instances.
pub fn live_sessions(
    sessions: SessionsResponse,
    instances: InstancesResponse,
    now: Timestamp,
) -> Vec<LiveSession> {
    let mut sizes: Map<u64, u64> = Map::new();
    for instance in instances.instances {
        *sizes.entry(instance.links.session).or_default() += instance.capacity.bytes;
    }
    sessions
        .sessions
        .into_iter()
        .map(|session| LiveSession {
            size: sizes.get(&session.id).copied(),
            name: session.token,
            user_id: UserId::new(session.owner),
            created: from_unix_seconds(session.created).unwrap_or(now),
            pool: None,
        })
        .collect()
}

/// Size in bytes reported by `real_size`
pub fn real_size(response: RealSizeResponse) -> anyhow::Result<u64> {
    match response.units.as_str() {
        "bytes" => Ok(response.capacity),
        units => anyhow::bail!("real_size reported unsupported units `{units}`"),
    }
}
