// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite pool construction and embedded migrations for the directory.

use crate::error::{AuthorityError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;

/// Create a SqlitePool with WAL mode and common settings.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| AuthorityError::Internal(format!("invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// Create the directory tables if they do not exist yet.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS users (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			email TEXT NOT NULL UNIQUE,
			username TEXT,
			tier INTEGER NOT NULL,
			api_key TEXT,
			created_at TEXT NOT NULL
		)",
	)
	.execute(pool)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS servers (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL,
			domain TEXT NOT NULL,
			exit_country TEXT NOT NULL,
			entry_country TEXT,
			city TEXT,
			status INTEGER NOT NULL DEFAULT 0,
			tier INTEGER NOT NULL DEFAULT 1,
			features INTEGER NOT NULL DEFAULT 0,
			transport TEXT NOT NULL,
			load INTEGER NOT NULL DEFAULT 0,
			created_at TEXT NOT NULL DEFAULT (datetime('now'))
		)",
	)
	.execute(pool)
	.await?;

	// Every id ever issued, so deleted sequences are never reallocated.
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS server_id_ledger (
			id TEXT PRIMARY KEY,
			exit_country TEXT NOT NULL,
			issued_at TEXT NOT NULL DEFAULT (datetime('now'))
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
