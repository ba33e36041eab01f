// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Directory repositories: the authority's user and server records.
//!
//! The storage engine is plain SQLite accessed as a record store; all
//! fleet semantics (sync triggers, cache invalidation) live in the service
//! layer, not here.

use crate::error::{AuthorityError, Result};
use chrono::{DateTime, Utc};
use shoal_common_types::{
	Server, ServerFeatures, ServerId, ServerStatus, User, UserTier, VpnTransport,
};
use sqlx::sqlite::SqlitePool;
use std::str::FromStr;

type UserRow = (
	i64,
	String,
	Option<String>,
	i64,
	Option<String>,
	String,
);

type ServerRow = (
	String,
	String,
	String,
	String,
	Option<String>,
	Option<String>,
	i64,
	i64,
	i64,
	String,
	i64,
);

fn user_from_row(row: UserRow) -> Result<User> {
	let (id, email, username, tier, api_key, created_at) = row;
	Ok(User {
		id,
		email,
		username,
		tier: UserTier::from_rank(tier as u8)
			.ok_or_else(|| AuthorityError::InvalidRecord(format!("user {id}: tier {tier}")))?,
		api_key,
		created_at: parse_datetime(&created_at)?,
	})
}

fn server_from_row(row: ServerRow) -> Result<Server> {
	let (id, name, domain, exit_country, entry_country, city, status, tier, features, transport, load) =
		row;
	Ok(Server {
		id: ServerId::from_str(&id)
			.map_err(|e| AuthorityError::InvalidRecord(e.to_string()))?,
		name,
		domain,
		exit_country,
		entry_country,
		city,
		status: ServerStatus::from_code(status as u8)
			.ok_or_else(|| AuthorityError::InvalidRecord(format!("server {id}: status {status}")))?,
		tier: UserTier::from_rank(tier as u8)
			.ok_or_else(|| AuthorityError::InvalidRecord(format!("server {id}: tier {tier}")))?,
		features: ServerFeatures(features as u32),
		transport: VpnTransport::from_str(&transport)
			.map_err(|e| AuthorityError::InvalidRecord(e.to_string()))?,
		load: load.clamp(0, 100) as u8,
	})
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.or_else(|_| {
			chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
				.map(|ndt| ndt.and_utc())
				.map_err(|_| AuthorityError::InvalidRecord(format!("invalid datetime: {s}")))
		})
}

/// Fields of a user update; `None` leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct UserPatch {
	pub email: Option<String>,
	pub username: Option<Option<String>>,
	pub tier: Option<UserTier>,
	pub api_key: Option<Option<String>>,
}

impl UserPatch {
	/// True when the patch touches a field that feeds credential derivation
	/// or node-side authorization, which forces a fleet sync.
	pub fn is_security_relevant(&self) -> bool {
		self.email.is_some() || self.api_key.is_some() || self.tier.is_some()
	}
}

#[derive(Clone)]
pub struct UserRepository {
	pool: SqlitePool,
}

impl UserRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, api_key), fields(%email))]
	pub async fn insert(
		&self,
		email: &str,
		username: Option<&str>,
		tier: UserTier,
		api_key: Option<&str>,
	) -> Result<User> {
		let created_at = Utc::now();
		let result = sqlx::query(
			"INSERT INTO users (email, username, tier, api_key, created_at)
			 VALUES (?, ?, ?, ?, ?)",
		)
		.bind(email)
		.bind(username)
		.bind(tier.rank() as i64)
		.bind(api_key)
		.bind(created_at.to_rfc3339())
		.execute(&self.pool)
		.await?;

		Ok(User {
			id: result.last_insert_rowid(),
			email: email.to_string(),
			username: username.map(str::to_string),
			tier,
			api_key: api_key.map(str::to_string),
			created_at,
		})
	}

	#[tracing::instrument(skip(self))]
	pub async fn get(&self, id: i64) -> Result<Option<User>> {
		let row: Option<UserRow> = sqlx::query_as(
			"SELECT id, email, username, tier, api_key, created_at FROM users WHERE id = ?",
		)
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;

		row.map(user_from_row).transpose()
	}

	#[tracing::instrument(skip(self), fields(%email))]
	pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
		let row: Option<UserRow> = sqlx::query_as(
			"SELECT id, email, username, tier, api_key, created_at FROM users WHERE email = ?",
		)
		.bind(email)
		.fetch_optional(&self.pool)
		.await?;

		row.map(user_from_row).transpose()
	}

	#[tracing::instrument(skip(self, api_key))]
	pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
		let row: Option<UserRow> = sqlx::query_as(
			"SELECT id, email, username, tier, api_key, created_at FROM users WHERE api_key = ?",
		)
		.bind(api_key)
		.fetch_optional(&self.pool)
		.await?;

		row.map(user_from_row).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<User>> {
		let rows: Vec<UserRow> = sqlx::query_as(
			"SELECT id, email, username, tier, api_key, created_at FROM users ORDER BY id",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(user_from_row).collect()
	}

	/// Apply a patch and return the updated record.
	#[tracing::instrument(skip(self, patch))]
	pub async fn update(&self, id: i64, patch: &UserPatch) -> Result<User> {
		let current = self
			.get(id)
			.await?
			.ok_or_else(|| AuthorityError::UserNotFound(id.to_string()))?;

		let email = patch.email.clone().unwrap_or(current.email);
		let username = patch.username.clone().unwrap_or(current.username);
		let tier = patch.tier.unwrap_or(current.tier);
		let api_key = patch.api_key.clone().unwrap_or(current.api_key);

		sqlx::query("UPDATE users SET email = ?, username = ?, tier = ?, api_key = ? WHERE id = ?")
			.bind(&email)
			.bind(&username)
			.bind(tier.rank() as i64)
			.bind(&api_key)
			.bind(id)
			.execute(&self.pool)
			.await?;

		Ok(User {
			id,
			email,
			username,
			tier,
			api_key,
			created_at: current.created_at,
		})
	}

	#[tracing::instrument(skip(self))]
	pub async fn delete(&self, id: i64) -> Result<u64> {
		let result = sqlx::query("DELETE FROM users WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}
}

/// Fields of a server update; `None` leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct ServerPatch {
	pub domain: Option<String>,
	pub status: Option<ServerStatus>,
	pub tier: Option<UserTier>,
	pub features: Option<ServerFeatures>,
	pub city: Option<Option<String>>,
}

#[derive(Clone)]
pub struct ServerRepository {
	pool: SqlitePool,
}

impl ServerRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Insert a new server, allocating its per-country id from the ledger of
	/// every id ever issued so deleted sequences are never reused.
	#[tracing::instrument(skip(self), fields(%exit_country))]
	pub async fn insert(
		&self,
		exit_country: &str,
		domain: &str,
		tier: UserTier,
		features: ServerFeatures,
		transport: VpnTransport,
		city: Option<&str>,
	) -> Result<Server> {
		let mut tx = self.pool.begin().await?;

		let issued: Vec<(String,)> =
			sqlx::query_as("SELECT id FROM server_id_ledger WHERE exit_country = ?")
				.bind(exit_country.to_lowercase())
				.fetch_all(&mut *tx)
				.await?;
		let issued_ids: Vec<ServerId> = issued
			.iter()
			.filter_map(|(id,)| ServerId::from_str(id).ok())
			.collect();

		let id = ServerId::allocate(exit_country, &issued_ids);
		let sequence: u32 = id
			.as_str()
			.rsplit_once('-')
			.and_then(|(_, seq)| seq.parse().ok())
			.ok_or_else(|| AuthorityError::InvalidRecord(format!("allocated id {id}")))?;
		let name = Server::display_name(exit_country, sequence);

		sqlx::query("INSERT INTO server_id_ledger (id, exit_country) VALUES (?, ?)")
			.bind(id.as_str())
			.bind(exit_country.to_lowercase())
			.execute(&mut *tx)
			.await?;

		sqlx::query(
			"INSERT INTO servers (id, name, domain, exit_country, city, status, tier, features, transport, load)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
		)
		.bind(id.as_str())
		.bind(&name)
		.bind(domain)
		.bind(exit_country.to_lowercase())
		.bind(city)
		.bind(ServerStatus::Offline.code() as i64)
		.bind(tier.rank() as i64)
		.bind(features.0 as i64)
		.bind(transport.as_str())
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;

		Ok(Server {
			id,
			name,
			domain: domain.to_string(),
			exit_country: exit_country.to_lowercase(),
			entry_country: None,
			city: city.map(str::to_string),
			status: ServerStatus::Offline,
			tier,
			features,
			transport,
			load: 0,
		})
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: &ServerId) -> Result<Option<Server>> {
		let row: Option<ServerRow> = sqlx::query_as(
			"SELECT id, name, domain, exit_country, entry_country, city, status, tier, features, transport, load
			 FROM servers WHERE id = ?",
		)
		.bind(id.as_str())
		.fetch_optional(&self.pool)
		.await?;

		row.map(server_from_row).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<Server>> {
		let rows: Vec<ServerRow> = sqlx::query_as(
			"SELECT id, name, domain, exit_country, entry_country, city, status, tier, features, transport, load
			 FROM servers ORDER BY id",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(server_from_row).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_online(&self) -> Result<Vec<Server>> {
		let rows: Vec<ServerRow> = sqlx::query_as(
			"SELECT id, name, domain, exit_country, entry_country, city, status, tier, features, transport, load
			 FROM servers WHERE status = ? ORDER BY id",
		)
		.bind(ServerStatus::Online.code() as i64)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(server_from_row).collect()
	}

	#[tracing::instrument(skip(self, patch), fields(%id))]
	pub async fn update(&self, id: &ServerId, patch: &ServerPatch) -> Result<Server> {
		let current = self
			.get(id)
			.await?
			.ok_or_else(|| AuthorityError::ServerNotFound(id.clone()))?;

		let domain = patch.domain.clone().unwrap_or(current.domain);
		let status = patch.status.unwrap_or(current.status);
		let tier = patch.tier.unwrap_or(current.tier);
		let features = patch.features.unwrap_or(current.features);
		let city = patch.city.clone().unwrap_or(current.city);

		sqlx::query(
			"UPDATE servers SET domain = ?, status = ?, tier = ?, features = ?, city = ? WHERE id = ?",
		)
		.bind(&domain)
		.bind(status.code() as i64)
		.bind(tier.rank() as i64)
		.bind(features.0 as i64)
		.bind(&city)
		.bind(id.as_str())
		.execute(&self.pool)
		.await?;

		Ok(Server {
			domain,
			status,
			tier,
			features,
			city,
			..current
		})
	}

	/// Overwrite the self-reported load (0-100); not accumulated.
	#[tracing::instrument(skip(self), fields(%id, load))]
	pub async fn update_load(&self, id: &ServerId, load: u8) -> Result<u64> {
		let result = sqlx::query("UPDATE servers SET load = ? WHERE id = ?")
			.bind(load.min(100) as i64)
			.bind(id.as_str())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}

	/// Delete the directory record. The id ledger entry stays so the
	/// sequence is never reissued.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn delete(&self, id: &ServerId) -> Result<u64> {
		let result = sqlx::query("DELETE FROM servers WHERE id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::memory_pool;

	#[tokio::test]
	async fn user_crud_round_trip() {
		let pool = memory_pool().await;
		let repo = UserRepository::new(pool);

		let user = repo
			.insert("a@b.com", Some("alice"), UserTier::Plus, Some("key-1"))
			.await
			.unwrap();
		assert!(user.id > 0);

		let fetched = repo.get(user.id).await.unwrap().unwrap();
		assert_eq!(fetched.email, "a@b.com");
		assert_eq!(fetched.tier, UserTier::Plus);

		let by_email = repo.find_by_email("a@b.com").await.unwrap().unwrap();
		assert_eq!(by_email.id, user.id);

		let patched = repo
			.update(
				user.id,
				&UserPatch {
					tier: Some(UserTier::Pro),
					api_key: Some(None),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert_eq!(patched.tier, UserTier::Pro);
		assert_eq!(patched.api_key, None);

		assert_eq!(repo.delete(user.id).await.unwrap(), 1);
		assert!(repo.get(user.id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn security_relevant_patch_detection() {
		assert!(!UserPatch::default().is_security_relevant());
		assert!(UserPatch {
			email: Some("x@y.com".to_string()),
			..Default::default()
		}
		.is_security_relevant());
		assert!(UserPatch {
			api_key: Some(None),
			..Default::default()
		}
		.is_security_relevant());
		assert!(!UserPatch {
			username: Some(Some("bob".to_string())),
			..Default::default()
		}
		.is_security_relevant());
	}

	#[tokio::test]
	async fn server_ids_are_sequential_and_never_reused() {
		let pool = memory_pool().await;
		let repo = ServerRepository::new(pool);

		let first = repo
			.insert(
				"de",
				"de-01.example.net",
				UserTier::Free,
				ServerFeatures::NONE,
				VpnTransport::Wireguard,
				None,
			)
			.await
			.unwrap();
		assert_eq!(first.id.as_str(), "de-01");
		assert_eq!(first.name, "DE#1");

		let second = repo
			.insert(
				"de",
				"de-02.example.net",
				UserTier::Free,
				ServerFeatures::NONE,
				VpnTransport::Wireguard,
				None,
			)
			.await
			.unwrap();
		assert_eq!(second.id.as_str(), "de-02");

		// Deleting de-02 must not free its sequence.
		repo.delete(&second.id).await.unwrap();
		let third = repo
			.insert(
				"de",
				"de-03.example.net",
				UserTier::Free,
				ServerFeatures::NONE,
				VpnTransport::Wireguard,
				None,
			)
			.await
			.unwrap();
		assert_eq!(third.id.as_str(), "de-03");

		// Other countries have their own sequence.
		let us = repo
			.insert(
				"us",
				"us-01.example.net",
				UserTier::Free,
				ServerFeatures::NONE,
				VpnTransport::Openvpn,
				None,
			)
			.await
			.unwrap();
		assert_eq!(us.id.as_str(), "us-01");
	}

	#[tokio::test]
	async fn list_online_filters_by_status() {
		let pool = memory_pool().await;
		let repo = ServerRepository::new(pool);

		let a = repo
			.insert("de", "a", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		let b = repo
			.insert("de", "b", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();

		repo.update(
			&a.id,
			&ServerPatch {
				status: Some(ServerStatus::Online),
				..Default::default()
			},
		)
		.await
		.unwrap();

		let online = repo.list_online().await.unwrap();
		assert_eq!(online.len(), 1);
		assert_eq!(online[0].id, a.id);
		assert_ne!(online[0].id, b.id);
	}

	#[tokio::test]
	async fn load_updates_overwrite_and_clamp() {
		let pool = memory_pool().await;
		let repo = ServerRepository::new(pool);

		let server = repo
			.insert("de", "a", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();

		repo.update_load(&server.id, 42).await.unwrap();
		assert_eq!(repo.get(&server.id).await.unwrap().unwrap().load, 42);

		repo.update_load(&server.id, 100).await.unwrap();
		assert_eq!(repo.get(&server.id).await.unwrap().unwrap().load, 100);
	}
}
