//! Contains types and functions related to the AAE workspace's configuration.

use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Wire protocol version spoken between an exchange engine and a remote
/// sink. Fixed at `w1`: older sink versions do not support AAE at all.
pub const WIRE_VERSION: &str = "w1";

/// Runtime configuration for the exchange engine and the Merkle helper.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Timeout applied to each FSM state transition, in milliseconds.
	#[serde(default = "default_anti_entropy_timeout_ms")]
	pub anti_entropy_timeout_ms: u64,

	/// Byte threshold (packed key bytes + 4-byte hash overhead) at which
	/// the Merkle helper flushes its write buffer to the external map.
	#[serde(default = "default_merkle_buffer_size")]
	pub merkle_buffer_size: usize,

	/// Batch size used when streaming divergent objects during key
	/// exchange, and when flushing offloaded keyfile records.
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			anti_entropy_timeout_ms: default_anti_entropy_timeout_ms(),
			merkle_buffer_size: default_merkle_buffer_size(),
			batch_size: default_batch_size(),
		}
	}
}

fn default_anti_entropy_timeout_ms() -> u64 {
	300_000
}
fn default_merkle_buffer_size() -> usize {
	4 * 1024 * 1024
}
fn default_batch_size() -> usize {
	1024
}

/// Read and parse a TOML configuration file.
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file)
		.map_err(|e| Error::message(format!("unable to open config file: {}", e)))?;

	let mut config = String::new();
	file.read_to_string(&mut config)
		.map_err(|e| Error::message(format!("unable to read config file: {}", e)))?;

	toml::from_str(&config).map_err(|e| Error::message(format!("invalid config: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let cfg = Config::default();
		assert_eq!(cfg.anti_entropy_timeout_ms, 300_000);
		assert_eq!(cfg.merkle_buffer_size, 4 * 1024 * 1024);
	}

	#[test]
	fn partial_config_fills_defaults() {
		let cfg: Config = toml::from_str("merkle_buffer_size = 1024\n").unwrap();
		assert_eq!(cfg.merkle_buffer_size, 1024);
		assert_eq!(cfg.anti_entropy_timeout_ms, 300_000);
	}
}
