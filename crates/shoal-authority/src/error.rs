// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

use shoal_common_types::ServerId;

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
	#[error("database error: {0}")]
	Db(#[from] sqlx::Error),

	#[error("user not found: {0}")]
	UserNotFound(String),

	#[error("server not found: {0}")]
	ServerNotFound(ServerId),

	#[error("access denied: {0}")]
	AccessDenied(String),

	#[error("server unavailable: {0}")]
	ServerUnavailable(ServerId),

	#[error("invalid record: {0}")]
	InvalidRecord(String),

	#[error("internal: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, AuthorityError>;
