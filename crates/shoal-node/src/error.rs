// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
	#[error("database error: {0}")]
	Db(#[from] sqlx::Error),

	#[error("registry entry not found: {0}")]
	EntryNotFound(String),

	#[error("peer backend error: {0}")]
	Peer(String),

	#[error("invalid record: {0}")]
	InvalidRecord(String),

	#[error("internal: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
