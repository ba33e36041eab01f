// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite pool and migrations for the node's local registry.

use crate::error::{NodeError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;

#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| NodeError::Internal(format!("invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// The registry must survive restarts; it is the node's only user store.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS registry_users (
			entry_key TEXT PRIMARY KEY,
			user_id INTEGER NOT NULL,
			email TEXT NOT NULL,
			username TEXT NOT NULL,
			token TEXT NOT NULL,
			tier INTEGER NOT NULL,
			wg_public_key TEXT,
			synced_at TEXT NOT NULL
		)",
	)
	.execute(pool)
	.await?;

	tracing::debug!("migrations applied");
	Ok(())
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
	let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
	run_migrations(&pool).await.unwrap();
	pool
}
