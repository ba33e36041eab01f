// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic fleet reconciliation.
//!
//! The push model in [`crate::sync`] is best-effort: a node that was down
//! during a fan-out, or that was freshly created, ends up with a registry
//! that drifts from the directory. This job closes the gap. Per online node
//! it fetches the registry digest, replays `Add` for directory users the
//! node is missing, and `Remove` for registry rows the directory no longer
//! knows. Both replays are idempotent, so sweeping is always safe.

use crate::directory::{ServerRepository, UserRepository};
use crate::sync::FleetSyncCoordinator;
use async_trait::async_trait;
use chrono::Utc;
use shoal_common_types::{RegistryDigest, Server, SyncAction, User, UserTier};
use shoal_jobs::{Job, JobError};
use std::collections::BTreeSet;
use std::time::Duration;

pub struct ReconcileJob {
	users: UserRepository,
	servers: ServerRepository,
	sync: FleetSyncCoordinator,
	http: reqwest::Client,
	fleet_secret: String,
	timeout: Duration,
	scheme: &'static str,
}

impl ReconcileJob {
	pub fn new(
		users: UserRepository,
		servers: ServerRepository,
		sync: FleetSyncCoordinator,
		fleet_secret: String,
		timeout: Duration,
	) -> Self {
		ReconcileJob {
			users,
			servers,
			sync,
			http: shoal_common_http::new_client(),
			fleet_secret,
			timeout,
			scheme: "https",
		}
	}

	pub fn with_plain_http(mut self) -> Self {
		self.scheme = "http";
		self
	}

	async fn fetch_digest(&self, server: &Server) -> Option<RegistryDigest> {
		let url = format!("{}://{}/api/registry", self.scheme, server.domain);
		let response = self
			.http
			.get(&url)
			.bearer_auth(&self.fleet_secret)
			.timeout(self.timeout)
			.send()
			.await;

		match response {
			Ok(response) if response.status().is_success() => {
				match response.json::<RegistryDigest>().await {
					Ok(digest) => Some(digest),
					Err(e) => {
						tracing::warn!(server_id = %server.id, error = %e, "bad registry digest");
						None
					}
				}
			}
			Ok(response) => {
				tracing::warn!(server_id = %server.id, status = %response.status(), "registry digest refused");
				None
			}
			Err(e) => {
				tracing::debug!(server_id = %server.id, error = %e, "node unreachable, skipping");
				None
			}
		}
	}

	/// Reconcile one node against the directory. Returns (added, removed).
	#[tracing::instrument(skip(self, users, server), fields(server_id = %server.id))]
	async fn reconcile_node(&self, users: &[User], server: &Server) -> Option<(usize, usize)> {
		let digest = self.fetch_digest(server).await?;
		let registered: BTreeSet<i64> = digest.entries.iter().map(|e| e.user_id).collect();
		let directory: BTreeSet<i64> = users.iter().map(|u| u.id).collect();

		let mut added = 0;
		for user in users.iter().filter(|u| !registered.contains(&u.id)) {
			if self
				.sync
				.sync_one(user, server, SyncAction::Add)
				.await
				.is_acked()
			{
				added += 1;
			}
		}

		let mut removed = 0;
		for entry in digest.entries.iter().filter(|e| !directory.contains(&e.user_id)) {
			// The directory record is gone; a minimal stand-in is enough
			// for a removal envelope.
			let ghost = User {
				id: entry.user_id,
				email: entry.email.clone(),
				username: None,
				tier: UserTier::Free,
				api_key: None,
				created_at: Utc::now(),
			};
			if self
				.sync
				.sync_one(&ghost, server, SyncAction::Remove)
				.await
				.is_acked()
			{
				removed += 1;
			}
		}

		if added > 0 || removed > 0 {
			tracing::info!(server_id = %server.id, added, removed, "registry reconciled");
		}
		Some((added, removed))
	}
}

#[async_trait]
impl Job for ReconcileJob {
	fn id(&self) -> &str {
		"fleet-reconcile"
	}

	fn name(&self) -> &str {
		"Fleet Registry Reconciliation"
	}

	async fn run(&self) -> shoal_jobs::Result<()> {
		let users = self
			.users
			.list()
			.await
			.map_err(|e| JobError::Failed(e.to_string()))?;
		let servers = self
			.servers
			.list_online()
			.await
			.map_err(|e| JobError::Failed(e.to_string()))?;

		for server in &servers {
			// Unreachable nodes are skipped, not failures; the next sweep
			// will catch them.
			self.reconcile_node(&users, server).await;
		}
		Ok(())
	}
}
