// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Push-based fleet synchronization.
//!
//! Every push is best-effort and independently reported: a node that is
//! down, slow, or rejects the envelope yields a structured [`SyncOutcome`]
//! rather than an error, so one bad node never aborts a fan-out.

use crate::directory::ServerRepository;
use reqwest::StatusCode;
use shoal_common_token::derive_token;
use shoal_common_types::{
	ApiResponse, Server, ServerId, SyncAction, SyncEnvelope, User, UserSnapshot, VpnTransport,
};
use shoal_common_wg::WgKeyPair;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Terminal result of one push to one node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
	/// The node accepted and applied the envelope.
	Acked,
	/// The node answered but refused the envelope.
	Rejected { status: u16, message: String },
	/// The node could not be reached at all.
	Unreachable { detail: String },
	/// No answer within the per-push deadline.
	Timeout,
}

impl SyncOutcome {
	pub fn is_acked(&self) -> bool {
		matches!(self, SyncOutcome::Acked)
	}
}

#[derive(Clone)]
pub struct FleetSyncCoordinator {
	http: reqwest::Client,
	servers: ServerRepository,
	fleet_secret: String,
	timeout: Duration,
	limit: Arc<Semaphore>,
	scheme: &'static str,
}

impl FleetSyncCoordinator {
	pub fn new(
		servers: ServerRepository,
		fleet_secret: String,
		timeout: Duration,
		max_in_flight: usize,
	) -> Self {
		FleetSyncCoordinator {
			http: shoal_common_http::new_client(),
			servers,
			fleet_secret,
			timeout,
			limit: Arc::new(Semaphore::new(max_in_flight.max(1))),
			scheme: "https",
		}
	}

	/// Talk plain HTTP to nodes; development setups only.
	pub fn with_plain_http(mut self) -> Self {
		self.scheme = "http";
		self
	}

	/// Push one envelope to one node. For WireGuard nodes a client keypair
	/// is generated unless the caller supplies the public key from an
	/// already-issued bundle.
	#[tracing::instrument(skip(self, user, server), fields(user_id = user.id, server_id = %server.id, ?action))]
	pub async fn sync_one(&self, user: &User, server: &Server, action: SyncAction) -> SyncOutcome {
		self.sync_one_with_key(user, server, action, None).await
	}

	#[tracing::instrument(skip_all, fields(user_id = user.id, server_id = %server.id, ?action))]
	pub async fn sync_one_with_key(
		&self,
		user: &User,
		server: &Server,
		action: SyncAction,
		wg_public_key: Option<String>,
	) -> SyncOutcome {
		let envelope = self.build_envelope(user, server, action, wg_public_key);
		let outcome = self.push(server, &envelope).await;
		match &outcome {
			SyncOutcome::Acked => tracing::debug!("sync acked"),
			other => tracing::warn!(?other, "sync failed"),
		}
		outcome
	}

	/// Fan an envelope out to every online node. Pushes run as spawned
	/// tasks behind a semaphore, so they complete even if the caller stops
	/// waiting, and a slow node never starves the rest.
	#[tracing::instrument(skip(self, user), fields(user_id = user.id, ?action))]
	pub async fn sync_all(
		&self,
		user: &User,
		action: SyncAction,
	) -> BTreeMap<ServerId, SyncOutcome> {
		let servers = match self.servers.list_online().await {
			Ok(servers) => servers,
			Err(e) => {
				tracing::error!(error = %e, "cannot list online servers for sync");
				return BTreeMap::new();
			}
		};

		let mut handles = Vec::with_capacity(servers.len());
		for server in servers {
			let this = self.clone();
			let user = user.clone();
			handles.push(tokio::spawn(async move {
				// A closed semaphore cannot happen; the coordinator never
				// closes it.
				let _permit = this.limit.acquire().await;
				let outcome = this.sync_one(&user, &server, action).await;
				(server.id, outcome)
			}));
		}

		let mut outcomes = BTreeMap::new();
		for handle in handles {
			match handle.await {
				Ok((id, outcome)) => {
					outcomes.insert(id, outcome);
				}
				Err(e) => tracing::error!(error = %e, "sync task panicked"),
			}
		}

		let failed = outcomes.values().filter(|o| !o.is_acked()).count();
		if failed > 0 {
			tracing::warn!(total = outcomes.len(), failed, "fleet sync incomplete");
		}
		outcomes
	}

	fn build_envelope(
		&self,
		user: &User,
		server: &Server,
		action: SyncAction,
		wg_public_key: Option<String>,
	) -> SyncEnvelope {
		let token = derive_token(user, &server.id, &self.fleet_secret);
		let mut snapshot = UserSnapshot::from_user(user, token);
		if server.transport == VpnTransport::Wireguard && action != SyncAction::Remove {
			let key = wg_public_key
				.unwrap_or_else(|| WgKeyPair::generate().public_key().to_base64());
			snapshot = snapshot.with_wg_public_key(key);
		}
		SyncEnvelope {
			action,
			user: snapshot,
			server_id: Some(server.id.clone()),
		}
	}

	async fn push(&self, server: &Server, envelope: &SyncEnvelope) -> SyncOutcome {
		let url = format!("{}://{}/api/user-sync", self.scheme, server.domain);
		let request = self
			.http
			.post(&url)
			.bearer_auth(&self.fleet_secret)
			.json(envelope)
			.timeout(self.timeout)
			.send();

		let response = match request.await {
			Ok(response) => response,
			Err(e) if e.is_timeout() => return SyncOutcome::Timeout,
			Err(e) => {
				return SyncOutcome::Unreachable {
					detail: e.to_string(),
				}
			}
		};

		let status = response.status();
		let body = response.text().await.unwrap_or_default();
		outcome_from_response(status, &body)
	}
}

fn outcome_from_response(status: StatusCode, body: &str) -> SyncOutcome {
	if !status.is_success() {
		return SyncOutcome::Rejected {
			status: status.as_u16(),
			message: truncate(body, 256),
		};
	}
	// A 2xx with success=false is still a rejection.
	match serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
		Ok(parsed) if !parsed.success => SyncOutcome::Rejected {
			status: status.as_u16(),
			message: parsed.message,
		},
		_ => SyncOutcome::Acked,
	}
}

fn truncate(s: &str, max: usize) -> String {
	if s.len() <= max {
		s.to_string()
	} else {
		let mut end = max;
		while !s.is_char_boundary(end) {
			end -= 1;
		}
		s[..end].to_string()
	}
}
