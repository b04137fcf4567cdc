//! Crash-consistent state file with the recorded allocations.
//!
//! Layout: [`STATE_HEADER`], then bincode encoded version, emulation flag,
//! record count and the records. With the emulation flag set every record is
//! followed by the allocation size.

mod saver;

pub use saver::StateSaver;

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bbcore::registry::{Accounting, Allocation};
use bbcore::request::BufferState;
use bbcore::{JobId, Timestamp, UserId};
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::common::utils::fs::sync_dir;
use crate::common::utils::time::from_unix_seconds;

pub const STATE_FILE_NAME: &str = "bb_state";
const STATE_HEADER: &[u8] = b"bbstate\0";

/// Version written by this controller
pub const STATE_VERSION: u32 = 2;
/// Files written before partition and QoS were recorded
const LEGACY_VERSION: u32 = 1;

#[inline]
fn bincode_config() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}

/// A persisted allocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAllocation {
    pub account: String,
    pub create_time: i64,
    /// Owning job, 0 for persistent buffers
    pub id: u32,
    pub name: String,
    pub partition: String,
    pub pool: String,
    pub qos: String,
    pub user_id: u32,
    /// Stored only with the emulation flag
    #[serde(skip)]
    pub size: u64,
}

#[derive(Deserialize)]
struct LegacyRecord {
    account: String,
    create_time: i64,
    id: u32,
    name: String,
    pool: String,
    user_id: u32,
}

impl From<LegacyRecord> for StoredAllocation {
    fn from(record: LegacyRecord) -> Self {
        StoredAllocation {
            account: record.account,
            create_time: record.create_time,
            id: record.id,
            name: record.name,
            partition: String::new(),
            pool: record.pool,
            qos: String::new(),
            user_id: record.user_id,
            size: 0,
        }
    }
}

impl StoredAllocation {
    pub fn from_allocation(allocation: &Allocation) -> Self {
        StoredAllocation {
            account: allocation.accounting.account.clone(),
            create_time: allocation.create_time.timestamp(),
            id: allocation.job_id.as_num(),
            name: allocation.name.clone(),
            partition: allocation.accounting.partition.clone(),
            pool: allocation.pool.clone(),
            qos: allocation.accounting.qos.clone(),
            user_id: allocation.user_id.as_num(),
            size: allocation.size,
        }
    }

    pub fn into_allocation(self, now: Timestamp) -> Allocation {
        let job_id = JobId::new(self.id);
        let create_time = from_unix_seconds(self.create_time).unwrap_or(now);
        Allocation {
            name: self.name,
            user_id: UserId::new(self.user_id),
            job_id,
            size: self.size,
            pool: self.pool,
            create_time,
            seen_time: create_time,
            use_time: None,
            state: if job_id == JobId::NONE {
                BufferState::Allocated
            } else {
                BufferState::StagedIn
            },
            accounting: Accounting {
                account: self.account,
                partition: self.partition,
                qos: self.qos,
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateFile {
    pub emulated: bool,
    pub allocations: Vec<StoredAllocation>,
}

fn decode_error(path: &Path, error: impl std::fmt::Display) -> crate::Error {
    crate::Error::DeserializationError(format!("{}: {error}", path.display()))
}

pub fn encode<W: Write>(mut writer: W, state: &StateFile) -> crate::Result<()> {
    writer.write_all(STATE_HEADER)?;
    bincode_config().serialize_into(&mut writer, &STATE_VERSION)?;
    bincode_config().serialize_into(&mut writer, &state.emulated)?;
    bincode_config().serialize_into(&mut writer, &(state.allocations.len() as u32))?;
    for allocation in &state.allocations {
        bincode_config().serialize_into(&mut writer, allocation)?;
        if state.emulated {
            bincode_config().serialize_into(&mut writer, &allocation.size)?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn decode(path: &Path, data: &[u8]) -> crate::Result<StateFile> {
    let Some(mut data) = data.strip_prefix(STATE_HEADER) else {
        return Err(decode_error(path, "not a burst buffer state file"));
    };
    let version: u32 = bincode_config()
        .deserialize_from(&mut data)
        .map_err(|error| decode_error(path, error))?;
    if version != STATE_VERSION && version != LEGACY_VERSION {
        return Err(crate::Error::VersionError(format!(
            "{} has version {version}, expected {STATE_VERSION} or {LEGACY_VERSION}",
            path.display()
        )));
    }
    let emulated: bool = bincode_config()
        .deserialize_from(&mut data)
        .map_err(|error| decode_error(path, error))?;
    let count: u32 = bincode_config()
        .deserialize_from(&mut data)
        .map_err(|error| decode_error(path, error))?;

    let mut allocations = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let mut allocation: StoredAllocation = if version == LEGACY_VERSION {
            bincode_config()
                .deserialize_from::<_, LegacyRecord>(&mut data)
                .map_err(|error| decode_error(path, error))?
                .into()
        } else {
            bincode_config()
                .deserialize_from(&mut data)
                .map_err(|error| decode_error(path, error))?
        };
        if emulated {
            allocation.size = bincode_config()
                .deserialize_from(&mut data)
                .map_err(|error| decode_error(path, error))?;
        }
        allocations.push(allocation);
    }
    if !data.is_empty() {
        log::warn!(
            "{} has {} unexpected trailing bytes",
            path.display(),
            data.len()
        );
    }
    Ok(StateFile {
        emulated,
        allocations,
    })
}

pub struct StatePaths {
    pub current: PathBuf,
    pub previous: PathBuf,
    pub fresh: PathBuf,
}

impl StatePaths {
    pub fn new(current: PathBuf) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = current.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        StatePaths {
            previous: with_suffix(".old"),
            fresh: with_suffix(".new"),
            current,
        }
    }
}

/// Writes the state next to the current file and promotes it once it is on
/// stable storage. The replaced file is kept as `.old`.
pub fn write_state(path: &Path, state: &StateFile) -> crate::Result<()> {
    let paths = StatePaths::new(path.to_path_buf());
    let file = File::create(&paths.fresh)?;
    let mut writer = BufWriter::new(file);
    encode(&mut writer, state)?;
    let file = writer
        .into_inner()
        .map_err(|error| crate::Error::IoError(error.into_error()))?;
    file.sync_all()?;
    drop(file);

    if paths.current.exists() {
        std::fs::rename(&paths.current, &paths.previous)?;
    }
    std::fs::rename(&paths.fresh, &paths.current)?;
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        sync_dir(dir)?;
    }
    log::debug!(
        "Saved {} allocation(s) to {}",
        state.allocations.len(),
        path.display()
    );
    Ok(())
}

fn read_file(path: &Path) -> crate::Result<Option<StateFile>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => file.read_to_end(&mut data)?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    decode(path, &data).map(Some)
}

/// Reads the state, falling back to the previous generation if the current
/// file is missing or damaged. `Ok(None)` means there is no state at all.
pub fn read_state(path: &Path) -> crate::Result<Option<StateFile>> {
    let paths = StatePaths::new(path.to_path_buf());
    let current_error = match read_file(&paths.current) {
        Ok(Some(state)) => return Ok(Some(state)),
        Ok(None) => None,
        Err(error) => {
            log::error!("Cannot read state file {}: {error}", paths.current.display());
            Some(error)
        }
    };
    match read_file(&paths.previous) {
        Ok(Some(state)) => {
            log::warn!("Recovered state from {}", paths.previous.display());
            Ok(Some(state))
        }
        Ok(None) => match current_error {
            Some(error) => Err(crate::Error::RecoveryError(error.to_string())),
            None => Ok(None),
        },
        Err(error) => Err(crate::Error::RecoveryError(format!(
            "{}; backup: {error}",
            current_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "state file missing".to_string())
        ))),
    }
}
