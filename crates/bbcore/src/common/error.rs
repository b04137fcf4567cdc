use thiserror::Error;

use crate::JobId;
use crate::request::BufferState;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid burst buffer request: {0}")]
    InvalidRequest(String),
    #[error("Job {job_id} has burst buffer in state {state}, cannot {operation}")]
    InvalidState {
        job_id: JobId,
        state: BufferState,
        operation: &'static str,
    },
    #[error("Job {0} has no burst buffer record")]
    UnknownJob(JobId),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<String> for CoreError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
