// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authority-owned user records and the ordered subscription tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier, ordered `Free < Plus < Pro`.
///
/// Servers carry a tier gate of the same type; a user may only use servers
/// whose gate is at or below their own tier. Serialized as its integer rank
/// so the wire format matches what nodes store locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserTier {
	Free,
	Plus,
	Pro,
}

impl UserTier {
	pub fn rank(self) -> u8 {
		match self {
			UserTier::Free => 1,
			UserTier::Plus => 2,
			UserTier::Pro => 3,
		}
	}

	pub fn from_rank(rank: u8) -> Option<Self> {
		match rank {
			1 => Some(UserTier::Free),
			2 => Some(UserTier::Plus),
			3 => Some(UserTier::Pro),
			_ => None,
		}
	}

	pub fn label(self) -> &'static str {
		match self {
			UserTier::Free => "Free",
			UserTier::Plus => "Plus",
			UserTier::Pro => "Pro",
		}
	}
}

impl Serialize for UserTier {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u8(self.rank())
	}
}

impl<'de> Deserialize<'de> for UserTier {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let rank = u8::deserialize(deserializer)?;
		UserTier::from_rank(rank)
			.ok_or_else(|| serde::de::Error::custom(format!("invalid tier rank: {rank}")))
	}
}

/// A user record as the authority stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	pub id: i64,
	pub email: String,
	/// Display name; falls back to the email address on the wire.
	pub username: Option<String>,
	pub tier: UserTier,
	/// Pre-issued API key. When present it is the base of the connection
	/// token; when absent a deterministic fallback base is derived instead.
	pub api_key: Option<String>,
	pub created_at: DateTime<Utc>,
}

impl User {
	/// Wire username: the explicit one, or the email address.
	pub fn wire_username(&self) -> &str {
		self.username.as_deref().unwrap_or(&self.email)
	}
}
