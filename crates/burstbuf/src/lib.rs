pub mod common;
pub mod config;
pub mod controller;
pub mod persist;
pub mod runner;
pub mod tool;

#[cfg(test)]
mod tests;

pub use crate::common::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use bbcore::{JobId, Map, Set, UserId};

pub const BB_VERSION: &str = env!("CARGO_PKG_VERSION");
