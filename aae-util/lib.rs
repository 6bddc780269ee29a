//! Shared plumbing for the AAE fullsync workspace: error taxonomy,
//! configuration, background task/worker runner, hashing and logging.

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
