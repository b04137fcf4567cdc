pub mod config;
pub mod ctx;
pub mod executor;
pub mod job;
pub mod scheduler;
