// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory cache of issued config bundles.
//!
//! Bundles are keyed by `(user, server)` and expire after a TTL. Each key
//! owns its own slot lock, so a slow bundle build for one pair never blocks
//! lookups for another, while two concurrent requests for the same pair
//! collapse into a single build.
//!
//! Directory mutations call the `invalidate_*` methods before they return,
//! so a client can never read a bundle derived from pre-mutation state.

use crate::bundle::ConfigBundle;
use crate::error::Result;
use shoal_common_types::ServerId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
	user_id: i64,
	server_id: ServerId,
}

struct Slot {
	bundle: Option<(ConfigBundle, Instant)>,
}

pub struct ConfigCache {
	ttl: Duration,
	slots: Mutex<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
}

impl ConfigCache {
	pub fn new(ttl: Duration) -> Self {
		ConfigCache {
			ttl,
			slots: Mutex::new(HashMap::new()),
		}
	}

	/// Return the cached bundle for `(user_id, server_id)`, building and
	/// storing a fresh one when absent or expired.
	#[tracing::instrument(skip(self, build), fields(user_id, %server_id))]
	pub async fn get_or_build<F, Fut>(
		&self,
		user_id: i64,
		server_id: &ServerId,
		build: F,
	) -> Result<ConfigBundle>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<ConfigBundle>>,
	{
		let slot = self.slot(user_id, server_id).await;
		let mut guard = slot.lock().await;

		if let Some((bundle, inserted_at)) = &guard.bundle {
			if inserted_at.elapsed() < self.ttl {
				tracing::debug!("cache hit");
				return Ok(bundle.clone());
			}
		}

		tracing::debug!("cache miss, building bundle");
		let bundle = build().await?;
		guard.bundle = Some((bundle.clone(), Instant::now()));
		Ok(bundle)
	}

	/// Peek without building; expired entries read as absent.
	pub async fn get(&self, user_id: i64, server_id: &ServerId) -> Option<ConfigBundle> {
		let slot = self.slot(user_id, server_id).await;
		let guard = slot.lock().await;
		match &guard.bundle {
			Some((bundle, inserted_at)) if inserted_at.elapsed() < self.ttl => Some(bundle.clone()),
			_ => None,
		}
	}

	/// Drop the bundle for one `(user, server)` pair.
	#[tracing::instrument(skip(self), fields(user_id, %server_id))]
	pub async fn invalidate_pair(&self, user_id: i64, server_id: &ServerId) {
		let mut slots = self.slots.lock().await;
		slots.remove(&CacheKey {
			user_id,
			server_id: server_id.clone(),
		});
	}

	/// Drop every bundle issued to a user, across all servers.
	#[tracing::instrument(skip(self))]
	pub async fn invalidate_user(&self, user_id: i64) {
		let mut slots = self.slots.lock().await;
		slots.retain(|key, _| key.user_id != user_id);
	}

	/// Drop every bundle issued for a server, across all users.
	#[tracing::instrument(skip(self), fields(%server_id))]
	pub async fn invalidate_server(&self, server_id: &ServerId) {
		let mut slots = self.slots.lock().await;
		slots.retain(|key, _| &key.server_id != server_id);
	}

	/// Drop everything.
	#[tracing::instrument(skip(self))]
	pub async fn clear(&self) {
		let mut slots = self.slots.lock().await;
		slots.clear();
	}

	pub async fn len(&self) -> usize {
		self.slots.lock().await.len()
	}

	async fn slot(&self, user_id: i64, server_id: &ServerId) -> Arc<Mutex<Slot>> {
		let mut slots = self.slots.lock().await;
		slots
			.entry(CacheKey {
				user_id,
				server_id: server_id.clone(),
			})
			.or_insert_with(|| Arc::new(Mutex::new(Slot { bundle: None })))
			.clone()
	}
}
