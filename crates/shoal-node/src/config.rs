// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node daemon configuration.
//!
//! Same layering as the authority: defaults, optional TOML file,
//! `SHOAL_NODE_*` environment. The node id and the fleet secret are
//! mandatory; a node that cannot authenticate pushes must not serve.

use serde::Deserialize;
use shoal_common_types::{ServerId, VpnTransport};
use std::path::Path;
use std::str::FromStr;
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

/// Fully resolved node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
	/// This node's directory identity, e.g. `de-01`.
	pub server_id: ServerId,
	pub transport: VpnTransport,
	/// Shared secret accepted from the authority and presented back to it.
	pub fleet_secret: String,
	/// Base URL of the authority, e.g. `https://authority.example.net`.
	pub authority_url: String,
	pub http: HttpConfig,
	pub database: DatabaseConfig,
	pub interfaces: InterfaceConfig,
	pub load: LoadConfig,
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
pub struct InterfaceConfig {
	/// WireGuard interface the peer backend manages.
	pub wireguard: String,
	/// Interface sampled for bandwidth.
	pub network: String,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
	pub max_connections: u32,
	pub connection_weight: f64,
	pub bandwidth_weight: f64,
	pub system_weight: f64,
	pub report_interval_secs: u64,
}

impl NodeConfig {
	pub fn socket_addr(&self) -> String {
		format!("{}:{}", self.http.host, self.http.port)
	}
}

#[derive(Debug, Default, Deserialize)]
struct FileLayer {
	server_id: Option<String>,
	transport: Option<String>,
	authority_url: Option<String>,
	http: Option<HttpLayer>,
	database: Option<DatabaseLayer>,
	interfaces: Option<InterfaceLayer>,
	load: Option<LoadLayer>,
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
struct InterfaceLayer {
	wireguard: Option<String>,
	network: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoadLayer {
	max_connections: Option<u32>,
	connection_weight: Option<f64>,
	bandwidth_weight: Option<f64>,
	system_weight: Option<f64>,
	report_interval_secs: Option<u64>,
}

pub fn load_config(config_path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
	let file: FileLayer = match config_path {
		Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
		None => FileLayer::default(),
	};

	let server_id_raw = env_or("SHOAL_NODE_SERVER_ID", file.server_id)
		.ok_or(ConfigError::Missing("SHOAL_NODE_SERVER_ID"))?;
	let server_id = ServerId::from_str(&server_id_raw).map_err(|e| ConfigError::Invalid {
		name: "SHOAL_NODE_SERVER_ID",
		detail: e.to_string(),
	})?;

	let transport_raw =
		env_or("SHOAL_NODE_TRANSPORT", file.transport).unwrap_or_else(|| "wireguard".to_string());
	let transport = VpnTransport::from_str(&transport_raw).map_err(|_| ConfigError::Invalid {
		name: "SHOAL_NODE_TRANSPORT",
		detail: format!("expected wireguard or openvpn, got {transport_raw:?}"),
	})?;

	let fleet_secret = load_secret_env("SHOAL_NODE_FLEET_SECRET")?
		.ok_or(ConfigError::Missing("SHOAL_NODE_FLEET_SECRET"))?;
	if fleet_secret.trim().is_empty() {
		return Err(ConfigError::Invalid {
			name: "SHOAL_NODE_FLEET_SECRET",
			detail: "must not be empty".to_string(),
		});
	}

	let authority_url = env_or("SHOAL_NODE_AUTHORITY_URL", file.authority_url)
		.ok_or(ConfigError::Missing("SHOAL_NODE_AUTHORITY_URL"))?;

	let http = HttpConfig {
		host: env_or("SHOAL_NODE_HOST", file.http.as_ref().and_then(|h| h.host.clone()))
			.unwrap_or_else(|| "0.0.0.0".to_string()),
		port: env_parse("SHOAL_NODE_PORT", file.http.as_ref().and_then(|h| h.port))?.unwrap_or(8088),
	};

	let database = DatabaseConfig {
		url: env_or("SHOAL_NODE_DATABASE_URL", file.database.and_then(|d| d.url))
			.unwrap_or_else(|| "sqlite:./shoal-node.db".to_string()),
	};

	let interfaces = InterfaceConfig {
		wireguard: env_or(
			"SHOAL_NODE_WG_INTERFACE",
			file.interfaces.as_ref().and_then(|i| i.wireguard.clone()),
		)
		.unwrap_or_else(|| "wg0".to_string()),
		network: env_or(
			"SHOAL_NODE_NET_INTERFACE",
			file.interfaces.as_ref().and_then(|i| i.network.clone()),
		)
		.unwrap_or_else(|| "eth0".to_string()),
	};

	let load = LoadConfig {
		max_connections: env_parse(
			"SHOAL_NODE_MAX_CONNECTIONS",
			file.load.as_ref().and_then(|l| l.max_connections),
		)?
		.unwrap_or(100),
		connection_weight: env_parse(
			"SHOAL_NODE_CONNECTION_WEIGHT",
			file.load.as_ref().and_then(|l| l.connection_weight),
		)?
		.unwrap_or(0.5),
		bandwidth_weight: env_parse(
			"SHOAL_NODE_BANDWIDTH_WEIGHT",
			file.load.as_ref().and_then(|l| l.bandwidth_weight),
		)?
		.unwrap_or(0.3),
		system_weight: env_parse(
			"SHOAL_NODE_SYSTEM_WEIGHT",
			file.load.as_ref().and_then(|l| l.system_weight),
		)?
		.unwrap_or(0.2),
		report_interval_secs: env_parse(
			"SHOAL_NODE_REPORT_INTERVAL_SECS",
			file.load.as_ref().and_then(|l| l.report_interval_secs),
		)?
		.unwrap_or(60),
	};

	if load.max_connections == 0 {
		return Err(ConfigError::Invalid {
			name: "SHOAL_NODE_MAX_CONNECTIONS",
			detail: "must be at least 1".to_string(),
		});
	}

	Ok(NodeConfig {
		server_id,
		transport,
		fleet_secret,
		authority_url,
		http,
		database,
		interfaces,
		load,
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
		Ok(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid {
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

	#[test]
	fn file_layer_parses_full_toml() {
		let layer: FileLayer = toml::from_str(
			r#"
			server_id = "de-01"
			transport = "wireguard"
			authority_url = "https://authority.example.net"

			[interfaces]
			wireguard = "wg1"

			[load]
			max_connections = 250
			connection_weight = 0.6
			"#,
		)
		.unwrap();
		assert_eq!(layer.server_id.as_deref(), Some("de-01"));
		assert_eq!(layer.interfaces.unwrap().wireguard.as_deref(), Some("wg1"));
		let load = layer.load.unwrap();
		assert_eq!(load.max_connections, Some(250));
		assert_eq!(load.connection_weight, Some(0.6));
		assert!(load.bandwidth_weight.is_none());
	}
}
