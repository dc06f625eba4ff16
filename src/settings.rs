use std::path::PathBuf;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::constants::{DEFAULT_BLOCK_SYNC_THRESHOLD, DEFAULT_POLL_INTERVAL};

pub const DEFAULT_SETTINGS_PATH: &str = "config/Default.toml";

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,

	#[clap(long = "provider.http_endpoint")]
	pub http_endpoint: Option<String>,

	#[clap(long = "db.path")]
	pub db_path: Option<PathBuf>,

	#[clap(long = "engine.max_depth")]
	pub max_depth: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Engine {
	pub max_depth: u64,

	#[serde(default = "default_block_sync_threshold")]
	pub block_sync_threshold: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Provider {
	pub http_endpoint: String,

	#[serde(default = "default_poll_interval_secs")]
	pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Db {
	pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub engine: Engine,
	pub provider: Provider,
	pub db: Db,
	pub health_check: Option<HealthCheck>,
}

fn default_block_sync_threshold() -> u64 {
	DEFAULT_BLOCK_SYNC_THRESHOLD
}

fn default_poll_interval_secs() -> u64 {
	DEFAULT_POLL_INTERVAL.as_secs()
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let config_path = opts
			.config_path
			.clone()
			.unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());
		let settings = Self::from_file_and_env(&config_path, opts)?;
		settings.validate_settings()?;
		Ok(settings)
	}

	/// File settings, overlaid with `CHAINTAIL__`-prefixed environment
	/// variables, overlaid with the command line.
	fn from_file_and_env(file: &str, opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut settings: Settings = Config::builder()
			.add_source(File::with_name(file))
			.add_source(Environment::with_prefix("CHAINTAIL").separator("__"))
			.build()?
			.try_deserialize()?;

		if let Some(http_endpoint) = opts.http_endpoint {
			settings.provider.http_endpoint = http_endpoint;
		}
		if let Some(db_path) = opts.db_path {
			settings.db.path = db_path;
		}
		if let Some(max_depth) = opts.max_depth {
			settings.engine.max_depth = max_depth;
		}
		Ok(settings)
	}

	pub fn validate_settings(&self) -> Result<(), ConfigError> {
		if self.engine.max_depth == 0 {
			return Err(ConfigError::Message("engine.max_depth must be greater than zero".to_string()))
		}
		if !self.provider.http_endpoint.starts_with("http") {
			return Err(ConfigError::Message(format!(
				"provider.http_endpoint {:?} is not an http(s) endpoint",
				self.provider.http_endpoint
			)))
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn write_settings_file(contents: &str) -> (tempfile::TempDir, String) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("Settings.toml");
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		(dir, path.to_str().unwrap().to_string())
	}

	const VALID_SETTINGS: &str = r#"
[engine]
max_depth = 6

[provider]
http_endpoint = "http://localhost:8545"

[db]
path = "data/chaintail.db"
"#;

	#[test]
	fn loads_settings_with_defaults_applied() {
		let (_dir, path) = write_settings_file(VALID_SETTINGS);
		let settings = Settings::new(CommandLineOptions {
			config_path: Some(path),
			..Default::default()
		})
		.unwrap();

		assert_eq!(settings.engine.max_depth, 6);
		assert_eq!(settings.engine.block_sync_threshold, DEFAULT_BLOCK_SYNC_THRESHOLD);
		assert_eq!(settings.provider.poll_interval_secs, DEFAULT_POLL_INTERVAL.as_secs());
		assert!(settings.health_check.is_none());
	}

	#[test]
	fn command_line_overrides_beat_the_file() {
		let (_dir, path) = write_settings_file(VALID_SETTINGS);
		let settings = Settings::new(CommandLineOptions {
			config_path: Some(path),
			http_endpoint: Some("https://example.com:8545".to_string()),
			max_depth: Some(12),
			db_path: None,
		})
		.unwrap();

		assert_eq!(settings.provider.http_endpoint, "https://example.com:8545");
		assert_eq!(settings.engine.max_depth, 12);
	}

	#[test]
	fn zero_depth_and_bad_endpoints_are_rejected() {
		let (_dir, path) = write_settings_file(VALID_SETTINGS);
		assert!(Settings::new(CommandLineOptions {
			config_path: Some(path.clone()),
			max_depth: Some(0),
			..Default::default()
		})
		.is_err());

		assert!(Settings::new(CommandLineOptions {
			config_path: Some(path),
			http_endpoint: Some("ws://localhost:8546".to_string()),
			..Default::default()
		})
		.is_err());
	}
}
