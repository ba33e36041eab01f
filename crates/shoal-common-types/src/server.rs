// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exit-node directory records: identity, status, tier gate, feature flags
//! and transport kind.

use crate::user::UserTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Node identity of the form `<exit-country>-<NN>`.
///
/// The per-country sequence is assigned once at creation, zero-padded to at
/// least two digits, and never reused even after the node is deleted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl<'de> Deserialize<'de> for ServerId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		// Wire inputs (path parameters, JSON bodies) go through the same
		// validation as any other parse.
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Error)]
pub enum ServerIdError {
	#[error("invalid server id: {0:?}")]
	Invalid(String),
}

impl ServerId {
	/// Build an id from a country code and an already-allocated sequence.
	pub fn new(exit_country: &str, sequence: u32) -> Self {
		ServerId(format!("{}-{:02}", exit_country.to_lowercase(), sequence))
	}

	/// Allocate the next id for a country given every id ever issued for it.
	///
	/// Ids belonging to other countries are ignored, so the full directory
	/// listing can be passed in unfiltered.
	pub fn allocate<'a>(exit_country: &str, existing: impl IntoIterator<Item = &'a ServerId>) -> Self {
		let country = exit_country.to_lowercase();
		let highest = existing
			.into_iter()
			.filter_map(|id| id.sequence_for(&country))
			.max()
			.unwrap_or(0);
		ServerId::new(&country, highest + 1)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn exit_country(&self) -> Option<&str> {
		self.0.rsplit_once('-').map(|(country, _)| country)
	}

	fn sequence_for(&self, country: &str) -> Option<u32> {
		let (prefix, seq) = self.0.rsplit_once('-')?;
		if prefix != country {
			return None;
		}
		seq.parse().ok()
	}
}

impl FromStr for ServerId {
	type Err = ServerIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.rsplit_once('-') {
			Some((country, seq))
				if !country.is_empty() && !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit()) =>
			{
				Ok(ServerId(s.to_string()))
			}
			_ => Err(ServerIdError::Invalid(s.to_string())),
		}
	}
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Operational status reported on the directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
	Offline,
	Online,
	Maintenance,
	Error,
}

impl ServerStatus {
	pub fn code(self) -> u8 {
		match self {
			ServerStatus::Offline => 0,
			ServerStatus::Online => 1,
			ServerStatus::Maintenance => 2,
			ServerStatus::Error => 3,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0 => Some(ServerStatus::Offline),
			1 => Some(ServerStatus::Online),
			2 => Some(ServerStatus::Maintenance),
			3 => Some(ServerStatus::Error),
			_ => None,
		}
	}
}

/// Independent feature bits; flags combine with bitwise OR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerFeatures(pub u32);

impl ServerFeatures {
	pub const ADBLOCKER: ServerFeatures = ServerFeatures(1);
	pub const SPLIT_TUNNELING: ServerFeatures = ServerFeatures(2);
	pub const KILL_SWITCH: ServerFeatures = ServerFeatures(4);
	pub const IPV6: ServerFeatures = ServerFeatures(8);
	pub const PORT_FORWARDING: ServerFeatures = ServerFeatures(16);
	pub const MULTI_HOP: ServerFeatures = ServerFeatures(32);
	pub const ALL: ServerFeatures = ServerFeatures(63);

	pub const NONE: ServerFeatures = ServerFeatures(0);

	pub fn contains(self, feature: ServerFeatures) -> bool {
		(self.0 & feature.0) == feature.0
	}

	pub fn with(self, feature: ServerFeatures) -> Self {
		ServerFeatures(self.0 | feature.0)
	}

	pub fn labels(self) -> Vec<&'static str> {
		let table = [
			(Self::ADBLOCKER, "AdBlocker"),
			(Self::SPLIT_TUNNELING, "Split-Tunneling"),
			(Self::KILL_SWITCH, "Kill-Switch"),
			(Self::IPV6, "IPv6"),
			(Self::PORT_FORWARDING, "Port-Forwarding"),
			(Self::MULTI_HOP, "Multi-Hop"),
		];
		table
			.into_iter()
			.filter(|(bit, _)| self.contains(*bit))
			.map(|(_, label)| label)
			.collect()
	}
}

/// VPN transport kind; exactly one per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnTransport {
	Wireguard,
	Openvpn,
}

impl VpnTransport {
	pub fn as_str(self) -> &'static str {
		match self {
			VpnTransport::Wireguard => "wireguard",
			VpnTransport::Openvpn => "openvpn",
		}
	}
}

impl FromStr for VpnTransport {
	type Err = ServerIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"wireguard" => Ok(VpnTransport::Wireguard),
			"openvpn" => Ok(VpnTransport::Openvpn),
			other => Err(ServerIdError::Invalid(other.to_string())),
		}
	}
}

/// A directory record for one exit node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
	pub id: ServerId,
	/// Display name, `CC#N`.
	pub name: String,
	pub domain: String,
	pub exit_country: String,
	pub entry_country: Option<String>,
	pub city: Option<String>,
	pub status: ServerStatus,
	pub tier: UserTier,
	pub features: ServerFeatures,
	pub transport: VpnTransport,
	/// Last self-reported composite load, 0-100.
	pub load: u8,
}

impl Server {
	/// Display name derived from country and sequence, e.g. `US#3`.
	pub fn display_name(exit_country: &str, sequence: u32) -> String {
		format!("{}#{}", exit_country.to_uppercase(), sequence)
	}

	pub fn is_online(&self) -> bool {
		self.status == ServerStatus::Online
	}

	/// Tier gate check: true when `tier` may use this server.
	pub fn admits(&self, tier: UserTier) -> bool {
		self.tier <= tier
	}
}
