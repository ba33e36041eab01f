// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The node's local user registry.
//!
//! Every user allowed to connect to this node has exactly one row, keyed by
//! `user_<id>_<sanitized email>`. Rows arrive via sync envelopes from the
//! authority and survive restarts; the registry is the node's only user
//! store, so credential checks work even when the authority is down.
//!
//! Applying an envelope is idempotent last-write-wins, and atomic with
//! respect to the peer list: either the row and its tunnel peer both change,
//! or the report says the apply failed and nothing changed.

use crate::error::{NodeError, Result};
use crate::peers::PeerBackend;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shoal_common_types::{
	RegistryDigest, RegistryDigestEntry, SyncAction, SyncEnvelope, UserTier,
};
use shoal_common_wg::{PeerSpec, WgPublicKey};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

/// Replace every byte outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_email(email: &str) -> String {
	email
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

pub fn entry_key(user_id: i64, email: &str) -> String {
	format!("user_{}_{}", user_id, sanitize_email(email))
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
	pub entry_key: String,
	pub user_id: i64,
	pub email: String,
	pub username: String,
	pub token: String,
	pub tier: UserTier,
	pub wg_public_key: Option<String>,
	pub synced_at: DateTime<Utc>,
}

type EntryRow = (
	String,
	i64,
	String,
	String,
	String,
	i64,
	Option<String>,
	String,
);

fn entry_from_row(row: EntryRow) -> Result<RegistryEntry> {
	let (entry_key, user_id, email, username, token, tier, wg_public_key, synced_at) = row;
	Ok(RegistryEntry {
		entry_key,
		user_id,
		email,
		username,
		token,
		tier: UserTier::from_rank(tier as u8)
			.ok_or_else(|| NodeError::InvalidRecord(format!("user {user_id}: tier {tier}")))?,
		wg_public_key,
		synced_at: DateTime::parse_from_rfc3339(&synced_at)
			.map(|dt| dt.with_timezone(&Utc))
			.map_err(|_| NodeError::InvalidRecord(format!("invalid datetime: {synced_at}")))?,
	})
}

const SELECT_COLUMNS: &str =
	"entry_key, user_id, email, username, token, tier, wg_public_key, synced_at";

#[derive(Clone)]
pub struct RegistryRepository {
	pool: SqlitePool,
}

impl RegistryRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, entry), fields(entry_key = %entry.entry_key))]
	pub async fn upsert(&self, entry: &RegistryEntry) -> Result<()> {
		sqlx::query(
			"INSERT INTO registry_users (entry_key, user_id, email, username, token, tier, wg_public_key, synced_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
			 ON CONFLICT(entry_key) DO UPDATE SET
				email = excluded.email,
				username = excluded.username,
				token = excluded.token,
				tier = excluded.tier,
				wg_public_key = excluded.wg_public_key,
				synced_at = excluded.synced_at",
		)
		.bind(&entry.entry_key)
		.bind(entry.user_id)
		.bind(&entry.email)
		.bind(&entry.username)
		.bind(&entry.token)
		.bind(entry.tier.rank() as i64)
		.bind(&entry.wg_public_key)
		.bind(entry.synced_at.to_rfc3339())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn get(&self, entry_key: &str) -> Result<Option<RegistryEntry>> {
		let row: Option<EntryRow> = sqlx::query_as(&format!(
			"SELECT {SELECT_COLUMNS} FROM registry_users WHERE entry_key = ?"
		))
		.bind(entry_key)
		.fetch_optional(&self.pool)
		.await?;
		row.map(entry_from_row).transpose()
	}

	pub async fn find_by_email(&self, email: &str) -> Result<Option<RegistryEntry>> {
		let row: Option<EntryRow> = sqlx::query_as(&format!(
			"SELECT {SELECT_COLUMNS} FROM registry_users WHERE email = ?"
		))
		.bind(email)
		.fetch_optional(&self.pool)
		.await?;
		row.map(entry_from_row).transpose()
	}

	pub async fn list(&self) -> Result<Vec<RegistryEntry>> {
		let rows: Vec<EntryRow> = sqlx::query_as(&format!(
			"SELECT {SELECT_COLUMNS} FROM registry_users ORDER BY entry_key"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(entry_from_row).collect()
	}

	pub async fn count(&self) -> Result<u64> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM registry_users")
			.fetch_one(&self.pool)
			.await?;
		Ok(count as u64)
	}

	#[tracing::instrument(skip(self))]
	pub async fn delete(&self, entry_key: &str) -> Result<u64> {
		let result = sqlx::query("DELETE FROM registry_users WHERE entry_key = ?")
			.bind(entry_key)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}
}

/// Result of applying one envelope, reported back to the authority.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
	pub action: SyncAction,
	pub entry_key: String,
	pub success: bool,
	pub message: String,
}

impl ApplyReport {
	fn ok(action: SyncAction, entry_key: String, message: impl Into<String>) -> Self {
		ApplyReport {
			action,
			entry_key,
			success: true,
			message: message.into(),
		}
	}

	fn failed(action: SyncAction, entry_key: String, message: impl Into<String>) -> Self {
		ApplyReport {
			action,
			entry_key,
			success: false,
			message: message.into(),
		}
	}
}

pub struct RegistryService {
	repo: RegistryRepository,
	peers: Arc<dyn PeerBackend>,
}

impl RegistryService {
	pub fn new(repo: RegistryRepository, peers: Arc<dyn PeerBackend>) -> Self {
		RegistryService { repo, peers }
	}

	pub fn repository(&self) -> &RegistryRepository {
		&self.repo
	}

	/// Apply a sync envelope. Never returns an error; every failure mode is
	/// folded into the report so the authority sees exactly what happened.
	#[tracing::instrument(skip(self, envelope), fields(action = ?envelope.action, user_id = envelope.user.id))]
	pub async fn apply(&self, envelope: &SyncEnvelope) -> ApplyReport {
		let key = entry_key(envelope.user.id, &envelope.user.email);
		match envelope.action {
			SyncAction::Add | SyncAction::Update => self.apply_upsert(envelope, key).await,
			SyncAction::Remove => self.apply_remove(envelope, key).await,
		}
	}

	async fn apply_upsert(&self, envelope: &SyncEnvelope, key: String) -> ApplyReport {
		let action = envelope.action;
		let existing = match self.repo.get(&key).await {
			Ok(existing) => existing,
			Err(e) => return ApplyReport::failed(action, key, e.to_string()),
		};

		// Reconcile the tunnel peer first; a row without a working peer
		// would admit a user who cannot actually connect.
		if let Some(new_key) = &envelope.user.wg_public_key {
			let new_key = match WgPublicKey::from_base64(new_key) {
				Ok(parsed) => parsed,
				Err(e) => {
					return ApplyReport::failed(action, key, format!("bad wg key: {e}"))
				}
			};

			if let Some(old) = existing.as_ref().and_then(|e| e.wg_public_key.as_deref()) {
				if old != new_key.to_base64() {
					if let Ok(old_key) = WgPublicKey::from_base64(old) {
						if let Err(e) = self.peers.remove_peer(&old_key).await {
							return ApplyReport::failed(
								action,
								key,
								format!("failed to drop replaced peer: {e}"),
							);
						}
					}
				}
			}

			let spec = PeerSpec::for_user(new_key, envelope.user.id);
			if let Err(e) = self.peers.ensure_peer(&spec).await {
				return ApplyReport::failed(action, key, format!("peer setup failed: {e}"));
			}
		}

		let entry = RegistryEntry {
			entry_key: key.clone(),
			user_id: envelope.user.id,
			email: envelope.user.email.clone(),
			username: envelope.user.username.clone(),
			token: envelope.user.token.clone(),
			tier: envelope.user.tier,
			wg_public_key: envelope.user.wg_public_key.clone(),
			synced_at: Utc::now(),
		};

		match self.repo.upsert(&entry).await {
			Ok(()) => {
				let verb = if existing.is_some() { "updated" } else { "added" };
				ApplyReport::ok(action, key, format!("user {verb}"))
			}
			Err(e) => ApplyReport::failed(action, key, e.to_string()),
		}
	}

	async fn apply_remove(&self, envelope: &SyncEnvelope, key: String) -> ApplyReport {
		let action = envelope.action;
		let existing = match self.repo.get(&key).await {
			Ok(Some(existing)) => existing,
			Ok(None) => return ApplyReport::failed(action, key, "not found"),
			Err(e) => return ApplyReport::failed(action, key, e.to_string()),
		};

		if let Some(stored) = &existing.wg_public_key {
			match WgPublicKey::from_base64(stored) {
				Ok(stored_key) => {
					if let Err(e) = self.peers.remove_peer(&stored_key).await {
						// Keep the row; a half-removed user would leave a
						// live peer with no registry trace.
						return ApplyReport::failed(
							action,
							key,
							format!("peer removal failed: {e}"),
						);
					}
				}
				Err(e) => {
					tracing::warn!(entry_key = %key, error = %e, "stored wg key unparseable, skipping peer removal");
				}
			}
		}

		match self.repo.delete(&key).await {
			Ok(_) => ApplyReport::ok(action, key, "user removed"),
			Err(e) => ApplyReport::failed(action, key, e.to_string()),
		}
	}

	/// Local credential check: look the user up by email and compare tokens
	/// in constant time.
	#[tracing::instrument(skip(self, token), fields(%email))]
	pub async fn verify(&self, email: &str, token: &str) -> Result<Option<RegistryEntry>> {
		let Some(entry) = self.repo.find_by_email(email).await? else {
			return Ok(None);
		};
		if shoal_common_token::tokens_match(&entry.token, token) {
			Ok(Some(entry))
		} else {
			Ok(None)
		}
	}

	/// Identity summary for the authority's reconciliation sweep.
	pub async fn digest(&self) -> Result<RegistryDigest> {
		let entries = self
			.repo
			.list()
			.await?
			.into_iter()
			.map(|entry| RegistryDigestEntry {
				entry_key: entry.entry_key,
				user_id: entry.user_id,
				email: entry.email,
			})
			.collect();
		Ok(RegistryDigest { entries })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::memory_pool;
	use crate::peers::testing::FakeBackend;
	use shoal_common_types::UserSnapshot;
	use shoal_common_wg::WgKeyPair;
	use std::sync::atomic::Ordering;

	fn envelope(action: SyncAction, user_id: i64, email: &str, token: &str, wg: Option<String>) -> SyncEnvelope {
		let user = UserSnapshot {
			id: user_id,
			email: email.to_string(),
			username: email.to_string(),
			token: token.to_string(),
			tier: UserTier::Free,
			created_at: Utc::now(),
			wg_public_key: wg,
		};
		SyncEnvelope {
			action,
			user,
			server_id: None,
		}
	}

	async fn service() -> (RegistryService, Arc<FakeBackend>) {
		let pool = memory_pool().await;
		let backend = Arc::new(FakeBackend::default());
		let service = RegistryService::new(
			RegistryRepository::new(pool),
			backend.clone() as Arc<dyn PeerBackend>,
		);
		(service, backend)
	}

	#[test]
	fn sanitization_and_entry_keys() {
		assert_eq!(sanitize_email("a@b.com"), "a_b_com");
		assert_eq!(sanitize_email("weird+tag@x.io"), "weird_tag_x_io");
		assert_eq!(sanitize_email("ok_name-1"), "ok_name-1");
		assert_eq!(entry_key(7, "a@b.com"), "user_7_a_b_com");
	}

	#[tokio::test]
	async fn add_then_update_is_idempotent_last_write_wins() {
		let (service, _) = service().await;

		let report = service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok-1", None))
			.await;
		assert!(report.success);
		assert_eq!(report.entry_key, "user_7_a_b_com");

		// Same user, new token.
		let report = service
			.apply(&envelope(SyncAction::Update, 7, "a@b.com", "tok-2", None))
			.await;
		assert!(report.success);

		let entry = service.repo.get("user_7_a_b_com").await.unwrap().unwrap();
		assert_eq!(entry.token, "tok-2");
		assert_eq!(service.repo.count().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn wg_key_change_replaces_the_peer() {
		let (service, backend) = service().await;
		let first = WgKeyPair::generate().public_key();
		let second = WgKeyPair::generate().public_key();

		service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(first.to_base64())))
			.await;
		assert!(backend.contains(&first));

		service
			.apply(&envelope(SyncAction::Update, 7, "a@b.com", "tok", Some(second.to_base64())))
			.await;
		assert!(!backend.contains(&first));
		assert!(backend.contains(&second));
		assert_eq!(backend.len(), 1);
	}

	#[tokio::test]
	async fn remove_of_unknown_user_reports_not_found() {
		let (service, _) = service().await;
		let report = service
			.apply(&envelope(SyncAction::Remove, 99, "ghost@b.com", "tok", None))
			.await;
		assert!(!report.success);
		assert_eq!(report.message, "not found");
	}

	#[tokio::test]
	async fn remove_drops_row_and_peer_together() {
		let (service, backend) = service().await;
		let key = WgKeyPair::generate().public_key();

		service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(key.to_base64())))
			.await;

		let report = service
			.apply(&envelope(SyncAction::Remove, 7, "a@b.com", "tok", None))
			.await;
		assert!(report.success);
		assert!(!backend.contains(&key));
		assert_eq!(service.repo.count().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn failed_peer_removal_keeps_the_row() {
		let (service, backend) = service().await;
		let key = WgKeyPair::generate().public_key();

		service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(key.to_base64())))
			.await;

		backend.fail.store(true, Ordering::SeqCst);
		let report = service
			.apply(&envelope(SyncAction::Remove, 7, "a@b.com", "tok", None))
			.await;
		assert!(!report.success);
		// No partial apply: the registry row is still there.
		assert_eq!(service.repo.count().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn failed_peer_setup_skips_the_upsert() {
		let (service, backend) = service().await;
		backend.fail.store(true, Ordering::SeqCst);

		let key = WgKeyPair::generate().public_key();
		let report = service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(key.to_base64())))
			.await;
		assert!(!report.success);
		assert_eq!(service.repo.count().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn verify_matches_only_the_exact_token() {
		// Tokens arrive as lowercase hex; the comparison rejects anything
		// that does not decode.
		let (service, _) = service().await;
		service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "aa11bb22", None))
			.await;

		assert!(service.verify("a@b.com", "aa11bb22").await.unwrap().is_some());
		assert!(service.verify("a@b.com", "aa11bb23").await.unwrap().is_none());
		assert!(service.verify("a@b.com", "not hex").await.unwrap().is_none());
		assert!(service.verify("ghost@b.com", "aa11bb22").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn stale_add_after_remove_reinstates_the_user() {
		// Envelope ordering is not guaranteed: a delayed Add retry can land
		// after the Remove it predates. Last write wins by arrival order, so
		// the user ends up present; the next reconciliation sweep cleans up.
		let (service, backend) = service().await;
		let key = WgKeyPair::generate().public_key();

		service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(key.to_base64())))
			.await;
		let report = service
			.apply(&envelope(SyncAction::Remove, 7, "a@b.com", "tok", None))
			.await;
		assert!(report.success);

		let report = service
			.apply(&envelope(SyncAction::Add, 7, "a@b.com", "tok", Some(key.to_base64())))
			.await;
		assert!(report.success);
		assert!(service.repo.get("user_7_a_b_com").await.unwrap().is_some());
		assert!(backend.contains(&key));
	}

	#[tokio::test]
	async fn digest_lists_identities() {
		let (service, _) = service().await;
		service
			.apply(&envelope(SyncAction::Add, 1, "a@b.com", "t", None))
			.await;
		service
			.apply(&envelope(SyncAction::Add, 2, "b@b.com", "t", None))
			.await;

		let digest = service.digest().await.unwrap();
		assert_eq!(digest.entries.len(), 2);
		assert_eq!(digest.entries[0].entry_key, "user_1_a_b_com");
		assert_eq!(digest.entries[1].user_id, 2);
	}
}
