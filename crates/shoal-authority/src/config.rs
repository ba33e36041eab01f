// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authority daemon configuration.
//!
//! Layered with standard precedence: built-in defaults, then an optional
//! TOML file, then `SHOAL_AUTHORITY_*` environment variables. The fleet
//! secret is mandatory — the daemon refuses to start without it, because
//! every node push and every credential derivation depends on it. Secrets
//! support `*_FILE` indirection so the value can live outside the
//! environment.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse config file: {0}")]
	Parse(#[from] toml::de::Error),

	#[error("missing required setting: {0}")]
	Missing(&'static str),

	#[error("invalid setting {name}: {detail}")]
	Invalid { name: &'static str, detail: String },
}

/// Fully resolved authority configuration.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
	pub http: HttpConfig,
	pub database: DatabaseConfig,
	/// Shared secret presented by and to every node as a bearer credential.
	pub fleet_secret: String,
	pub sync: SyncConfig,
	pub cache: CacheConfig,
	pub jobs: JobsConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
	pub host: String,
	pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
	pub url: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Per-node push timeout.
	pub timeout_secs: u64,
	/// Upper bound on concurrent outbound pushes.
	pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
	/// Config bundle TTL in minutes.
	pub ttl_minutes: u64,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
	/// Fleet reconciliation sweep interval.
	pub reconcile_interval_secs: u64,
}

impl AuthorityConfig {
	pub fn socket_addr(&self) -> String {
		format!("{}:{}", self.http.host, self.http.port)
	}
}

/// Raw TOML layer; every field optional so the file can be partial.
#[derive(Debug, Default, Deserialize)]
struct FileLayer {
	http: Option<HttpLayer>,
	database: Option<DatabaseLayer>,
	sync: Option<SyncLayer>,
	cache: Option<CacheLayer>,
	jobs: Option<JobsLayer>,
}

#[derive(Debug, Default, Deserialize)]
struct HttpLayer {
	host: Option<String>,
	port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseLayer {
	url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncLayer {
	timeout_secs: Option<u64>,
	max_in_flight: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheLayer {
	ttl_minutes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsLayer {
	reconcile_interval_secs: Option<u64>,
}

/// Load configuration from defaults, an optional file, and the environment.
pub fn load_config(config_path: Option<&Path>) -> Result<AuthorityConfig, ConfigError> {
	let file = match config_path {
		Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
		None => FileLayer::default(),
	};

	let http = HttpConfig {
		host: env_or("SHOAL_AUTHORITY_HOST", file.http.as_ref().and_then(|h| h.host.clone()))
			.unwrap_or_else(|| "0.0.0.0".to_string()),
		port: env_parse("SHOAL_AUTHORITY_PORT", file.http.as_ref().and_then(|h| h.port))?
			.unwrap_or(8080),
	};

	let database = DatabaseConfig {
		url: env_or(
			"SHOAL_AUTHORITY_DATABASE_URL",
			file.database.and_then(|d| d.url),
		)
		.unwrap_or_else(|| "sqlite:./shoal-authority.db".to_string()),
	};

	let fleet_secret = load_secret_env("SHOAL_AUTHORITY_FLEET_SECRET")?
		.ok_or(ConfigError::Missing("SHOAL_AUTHORITY_FLEET_SECRET"))?;
	if fleet_secret.trim().is_empty() {
		return Err(ConfigError::Invalid {
			name: "SHOAL_AUTHORITY_FLEET_SECRET",
			detail: "must not be empty".to_string(),
		});
	}

	let sync = SyncConfig {
		timeout_secs: env_parse(
			"SHOAL_AUTHORITY_SYNC_TIMEOUT_SECS",
			file.sync.as_ref().and_then(|s| s.timeout_secs),
		)?
		.unwrap_or(5),
		max_in_flight: env_parse(
			"SHOAL_AUTHORITY_SYNC_MAX_IN_FLIGHT",
			file.sync.as_ref().and_then(|s| s.max_in_flight),
		)?
		.unwrap_or(8),
	};

	let cache = CacheConfig {
		ttl_minutes: env_parse(
			"SHOAL_AUTHORITY_CACHE_TTL_MINUTES",
			file.cache.as_ref().and_then(|c| c.ttl_minutes),
		)?
		.unwrap_or(60),
	};

	let jobs = JobsConfig {
		reconcile_interval_secs: env_parse(
			"SHOAL_AUTHORITY_RECONCILE_INTERVAL_SECS",
			file.jobs.as_ref().and_then(|j| j.reconcile_interval_secs),
		)?
		.unwrap_or(300),
	};

	Ok(AuthorityConfig {
		http,
		database,
		fleet_secret,
		sync,
		cache,
		jobs,
	})
}

fn env_or(name: &'static str, fallback: Option<String>) -> Option<String> {
	std::env::var(name).ok().or(fallback)
}

fn env_parse<T: std::str::FromStr>(
	name: &'static str,
	fallback: Option<T>,
) -> Result<Option<T>, ConfigError> {
	match std::env::var(name) {
		Ok(raw) => raw
			.parse()
			.map(Some)
			.map_err(|_| ConfigError::Invalid {
				name,
				detail: format!("cannot parse {raw:?}"),
			}),
		Err(_) => Ok(fallback),
	}
}

/// Load a secret from `NAME` or, failing that, the file named by `NAME_FILE`.
pub fn load_secret_env(name: &'static str) -> Result<Option<String>, ConfigError> {
	if let Ok(value) = std::env::var(name) {
		return Ok(Some(value));
	}
	let file_var = format!("{name}_FILE");
	if let Ok(path) = std::env::var(&file_var) {
		let content = std::fs::read_to_string(&path)?;
		return Ok(Some(content.trim().to_string()));
	}
	Ok(None)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn file_layer_parses_partial_toml() {
		let layer: FileLayer = toml::from_str(
			r#"
			[http]
			port = 9000

			[sync]
			timeout_secs = 2
			"#,
		)
		.unwrap();
		assert_eq!(layer.http.unwrap().port, Some(9000));
		assert_eq!(layer.sync.unwrap().timeout_secs, Some(2));
		assert!(layer.database.is_none());
	}

	#[test]
	fn secret_file_indirection_trims_whitespace() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "s3cret").unwrap();
		std::env::set_var("SHOAL_TEST_SECRET_FILE", file.path());
		let secret = load_secret_env("SHOAL_TEST_SECRET").unwrap();
		std::env::remove_var("SHOAL_TEST_SECRET_FILE");
		assert_eq!(secret.as_deref(), Some("s3cret"));
	}
}
