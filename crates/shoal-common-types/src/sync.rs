// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The sync event wire format pushed from the authority to a node.
//!
//! Envelopes are ephemeral: they are built per push, delivered best-effort,
//! and never persisted centrally. A node must tolerate envelopes arriving
//! out of causal order; applying them is idempotent last-write-wins.

use crate::server::ServerId;
use crate::user::{User, UserTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
	Add,
	Update,
	Remove,
}

/// The user projection a node is allowed to hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
	pub id: i64,
	pub email: String,
	pub username: String,
	/// Connection token derived for this (user, node) pair.
	pub token: String,
	pub tier: UserTier,
	pub created_at: DateTime<Utc>,
	/// Present only for nodes with a key-exchange transport.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub wg_public_key: Option<String>,
}

impl UserSnapshot {
	pub fn from_user(user: &User, token: String) -> Self {
		UserSnapshot {
			id: user.id,
			email: user.email.clone(),
			username: user.wire_username().to_string(),
			token,
			tier: user.tier,
			created_at: user.created_at,
			wg_public_key: None,
		}
	}

	pub fn with_wg_public_key(mut self, public_key: String) -> Self {
		self.wg_public_key = Some(public_key);
		self
	}
}

/// One push from the authority to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
	pub action: SyncAction,
	pub user: UserSnapshot,
	/// Target node; informational for the node, which only serves itself.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server_id: Option<ServerId>,
}

/// One registry row as a node summarizes it for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDigestEntry {
	pub entry_key: String,
	pub user_id: i64,
	pub email: String,
}

/// A node's registry contents, reduced to identities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDigest {
	pub entries: Vec<RegistryDigestEntry>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snapshot() -> UserSnapshot {
		UserSnapshot {
			id: 7,
			email: "a@b.com".to_string(),
			username: "a@b.com".to_string(),
			token: "deadbeef".to_string(),
			tier: UserTier::Free,
			created_at: Utc::now(),
			wg_public_key: None,
		}
	}

	#[test]
	fn action_serializes_lowercase() {
		assert_eq!(serde_json::to_string(&SyncAction::Add).unwrap(), "\"add\"");
		assert_eq!(
			serde_json::to_string(&SyncAction::Remove).unwrap(),
			"\"remove\""
		);
	}

	#[test]
	fn wg_key_is_omitted_when_absent() {
		let envelope = SyncEnvelope {
			action: SyncAction::Add,
			user: snapshot(),
			server_id: None,
		};
		let json = serde_json::to_value(&envelope).unwrap();
		assert!(json["user"].get("wg_public_key").is_none());

		let envelope = SyncEnvelope {
			action: SyncAction::Add,
			user: snapshot().with_wg_public_key("pk".to_string()),
			server_id: None,
		};
		let json = serde_json::to_value(&envelope).unwrap();
		assert_eq!(json["user"]["wg_public_key"], "pk");
	}
}
