// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Directory mutations and the fleet effects they trigger.
//!
//! The rules live here, not in the HTTP layer:
//! - user created            → push `Add` to every online node
//! - user security change    → drop the user's cached bundles, push `Update`
//! - user deleted            → drop bundles, push `Remove`
//! - server create/update/delete → drop the server's cached bundles only;
//!   backfilling a new or changed node is the reconciliation job's work.
//!
//! Cache invalidation always happens before the push fan-out starts, so no
//! request served during the fan-out can observe pre-mutation bundles.

use crate::bundle::{build_bundle, ConfigBundle};
use crate::cache::ConfigCache;
use crate::directory::{ServerPatch, ServerRepository, UserPatch, UserRepository};
use crate::error::{AuthorityError, Result};
use crate::sync::{FleetSyncCoordinator, SyncOutcome};
use shoal_common_token::{derive_token, tokens_match};
use shoal_common_types::{
	Server, ServerFeatures, ServerId, SyncAction, User, UserSnapshot, UserTier, VpnTransport,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SyncReport = BTreeMap<ServerId, SyncOutcome>;

#[derive(Clone)]
pub struct AuthorityService {
	pub users: UserRepository,
	pub servers: ServerRepository,
	pub cache: Arc<ConfigCache>,
	pub sync: FleetSyncCoordinator,
	fleet_secret: String,
}

impl AuthorityService {
	pub fn new(
		users: UserRepository,
		servers: ServerRepository,
		cache: Arc<ConfigCache>,
		sync: FleetSyncCoordinator,
		fleet_secret: String,
	) -> Self {
		AuthorityService {
			users,
			servers,
			cache,
			sync,
			fleet_secret,
		}
	}

	#[tracing::instrument(skip_all, fields(%email))]
	pub async fn create_user(
		&self,
		email: &str,
		username: Option<&str>,
		tier: UserTier,
		api_key: Option<&str>,
	) -> Result<(User, SyncReport)> {
		let user = self.users.insert(email, username, tier, api_key).await?;
		let report = self.sync.sync_all(&user, SyncAction::Add).await;
		Ok((user, report))
	}

	#[tracing::instrument(skip(self, patch), fields(user_id = id))]
	pub async fn update_user(&self, id: i64, patch: UserPatch) -> Result<(User, Option<SyncReport>)> {
		let security_relevant = patch.is_security_relevant();
		let user = self.users.update(id, &patch).await?;

		if !security_relevant {
			return Ok((user, None));
		}

		// Tokens derived before this point are stale now.
		self.cache.invalidate_user(user.id).await;
		let report = self.sync.sync_all(&user, SyncAction::Update).await;
		Ok((user, Some(report)))
	}

	#[tracing::instrument(skip(self), fields(user_id = id))]
	pub async fn delete_user(&self, id: i64) -> Result<SyncReport> {
		let user = self
			.users
			.get(id)
			.await?
			.ok_or_else(|| AuthorityError::UserNotFound(id.to_string()))?;

		self.users.delete(id).await?;
		self.cache.invalidate_user(id).await;
		let report = self.sync.sync_all(&user, SyncAction::Remove).await;
		Ok(report)
	}

	#[tracing::instrument(skip_all, fields(%exit_country))]
	pub async fn create_server(
		&self,
		exit_country: &str,
		domain: &str,
		tier: UserTier,
		features: ServerFeatures,
		transport: VpnTransport,
		city: Option<&str>,
	) -> Result<Server> {
		// New nodes start offline and empty; the reconciliation job fills
		// their registry once they come online.
		self.servers
			.insert(exit_country, domain, tier, features, transport, city)
			.await
	}

	#[tracing::instrument(skip(self, patch), fields(%id))]
	pub async fn update_server(&self, id: &ServerId, patch: ServerPatch) -> Result<Server> {
		let server = self.servers.update(id, &patch).await?;
		self.cache.invalidate_server(id).await;
		Ok(server)
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn delete_server(&self, id: &ServerId) -> Result<()> {
		let affected = self.servers.delete(id).await?;
		if affected == 0 {
			return Err(AuthorityError::ServerNotFound(id.clone()));
		}
		self.cache.invalidate_server(id).await;
		Ok(())
	}

	/// Online servers at or below the user's tier.
	pub async fn servers_for(&self, user: &User) -> Result<Vec<Server>> {
		let online = self.servers.list_online().await?;
		Ok(online.into_iter().filter(|s| s.admits(user.tier)).collect())
	}

	/// Issue (or re-serve) a config bundle for one user on one server.
	///
	/// With `push_to_node` the node also receives the bundle's WireGuard
	/// public key via a single sync push, so the tunnel works immediately.
	#[tracing::instrument(skip(self, user), fields(user_id = user.id, %server_id, push_to_node))]
	pub async fn issue_bundle(
		&self,
		user: &User,
		server_id: &ServerId,
		push_to_node: bool,
	) -> Result<(ConfigBundle, Option<SyncOutcome>)> {
		let server = self
			.servers
			.get(server_id)
			.await?
			.ok_or_else(|| AuthorityError::ServerNotFound(server_id.clone()))?;

		if !server.admits(user.tier) {
			return Err(AuthorityError::AccessDenied(format!(
				"server {} requires tier {}",
				server.id,
				server.tier.label()
			)));
		}
		if !server.is_online() {
			return Err(AuthorityError::ServerUnavailable(server.id.clone()));
		}

		let secret = self.fleet_secret.clone();
		let bundle = self
			.cache
			.get_or_build(user.id, server_id, || {
				let user = user.clone();
				let server = server.clone();
				async move { Ok(build_bundle(&user, &server, &secret)) }
			})
			.await?;

		let outcome = if push_to_node {
			Some(
				self.sync
					.sync_one_with_key(user, &server, SyncAction::Update, bundle.wg_public_key.clone())
					.await,
			)
		} else {
			None
		};

		Ok((bundle, outcome))
	}

	/// Authority-side credential check, used by nodes that want the source
	/// of truth instead of their local registry.
	#[tracing::instrument(skip(self, token), fields(%email, %server_id))]
	pub async fn verify_credentials(
		&self,
		email: &str,
		server_id: &ServerId,
		token: &str,
	) -> Result<UserSnapshot> {
		let user = self
			.users
			.find_by_email(email)
			.await?
			.ok_or_else(|| AuthorityError::AccessDenied("unknown user".to_string()))?;
		let server = self
			.servers
			.get(server_id)
			.await?
			.ok_or_else(|| AuthorityError::ServerNotFound(server_id.clone()))?;

		if !server.admits(user.tier) {
			return Err(AuthorityError::AccessDenied("tier too low".to_string()));
		}
		if !server.is_online() {
			return Err(AuthorityError::ServerUnavailable(server.id.clone()));
		}

		let expected = derive_token(&user, server_id, &self.fleet_secret);
		if !tokens_match(&expected, token) {
			return Err(AuthorityError::AccessDenied("invalid token".to_string()));
		}

		Ok(UserSnapshot::from_user(&user, expected))
	}

	/// Record a node's self-reported composite load.
	#[tracing::instrument(skip(self), fields(%server_id, load))]
	pub async fn record_load(&self, server_id: &ServerId, load: u8) -> Result<()> {
		let affected = self.servers.update_load(server_id, load).await?;
		if affected == 0 {
			return Err(AuthorityError::ServerNotFound(server_id.clone()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::memory_pool;
	use crate::directory::ServerPatch;
	use shoal_common_types::ServerStatus;
	use std::time::Duration;

	async fn service() -> AuthorityService {
		let pool = memory_pool().await;
		let users = UserRepository::new(pool.clone());
		let servers = ServerRepository::new(pool);
		let sync = FleetSyncCoordinator::new(
			servers.clone(),
			"secret".to_string(),
			Duration::from_millis(200),
			4,
		)
		.with_plain_http();
		AuthorityService::new(
			users,
			servers,
			Arc::new(ConfigCache::new(Duration::from_secs(3600))),
			sync,
			"secret".to_string(),
		)
	}

	async fn online_server(service: &AuthorityService, country: &str, tier: UserTier) -> Server {
		let server = service
			.create_server(country, "127.0.0.1:1", tier, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		service
			.update_server(
				&server.id,
				ServerPatch {
					status: Some(ServerStatus::Online),
					..Default::default()
				},
			)
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn tier_gate_blocks_bundle_issue() {
		let service = service().await;
		let server = online_server(&service, "de", UserTier::Pro).await;
		let (user, _) = service
			.create_user("a@b.com", None, UserTier::Free, None)
			.await
			.unwrap();

		let err = service.issue_bundle(&user, &server.id, false).await.unwrap_err();
		assert!(matches!(err, AuthorityError::AccessDenied(_)));
	}

	#[tokio::test]
	async fn offline_server_cannot_issue() {
		let service = service().await;
		let server = service
			.create_server("de", "127.0.0.1:1", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		let (user, _) = service
			.create_user("a@b.com", None, UserTier::Free, None)
			.await
			.unwrap();

		let err = service.issue_bundle(&user, &server.id, false).await.unwrap_err();
		assert!(matches!(err, AuthorityError::ServerUnavailable(_)));
	}

	#[tokio::test]
	async fn issued_bundles_are_cached_until_user_changes() {
		let service = service().await;
		let server = online_server(&service, "de", UserTier::Free).await;
		let (user, _) = service
			.create_user("a@b.com", None, UserTier::Free, None)
			.await
			.unwrap();

		let (first, _) = service.issue_bundle(&user, &server.id, false).await.unwrap();
		let (again, _) = service.issue_bundle(&user, &server.id, false).await.unwrap();
		assert_eq!(first.client_id, again.client_id);

		// A security-relevant update drops the bundle.
		let (user, _) = service
			.update_user(
				user.id,
				UserPatch {
					api_key: Some(Some("new-key".to_string())),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let (rebuilt, _) = service.issue_bundle(&user, &server.id, false).await.unwrap();
		assert_ne!(first.client_id, rebuilt.client_id);
		assert_ne!(first.token, rebuilt.token);
	}

	#[tokio::test]
	async fn cosmetic_user_update_triggers_no_sync() {
		let service = service().await;
		let (user, _) = service
			.create_user("a@b.com", None, UserTier::Free, None)
			.await
			.unwrap();

		let (_, report) = service
			.update_user(
				user.id,
				UserPatch {
					username: Some(Some("alice".to_string())),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert!(report.is_none());
	}

	#[tokio::test]
	async fn verify_credentials_checks_token_tier_and_status() {
		let service = service().await;
		let server = online_server(&service, "de", UserTier::Free).await;
		let (user, _) = service
			.create_user("a@b.com", None, UserTier::Free, Some("key-1"))
			.await
			.unwrap();

		let token = derive_token(&user, &server.id, "secret");
		let snapshot = service
			.verify_credentials("a@b.com", &server.id, &token)
			.await
			.unwrap();
		assert_eq!(snapshot.id, user.id);

		let err = service
			.verify_credentials("a@b.com", &server.id, "wrong")
			.await
			.unwrap_err();
		assert!(matches!(err, AuthorityError::AccessDenied(_)));

		let err = service
			.verify_credentials("ghost@b.com", &server.id, &token)
			.await
			.unwrap_err();
		assert!(matches!(err, AuthorityError::AccessDenied(_)));
	}

	#[tokio::test]
	async fn load_report_rejects_unknown_server() {
		let service = service().await;
		let unknown: ServerId = "zz-99".parse().unwrap();
		let err = service.record_load(&unknown, 10).await.unwrap_err();
		assert!(matches!(err, AuthorityError::ServerNotFound(_)));
	}

	#[tokio::test]
	async fn server_listing_respects_tier() {
		let service = service().await;
		online_server(&service, "de", UserTier::Free).await;
		online_server(&service, "us", UserTier::Pro).await;

		let (free_user, _) = service
			.create_user("free@b.com", None, UserTier::Free, None)
			.await
			.unwrap();
		let (pro_user, _) = service
			.create_user("pro@b.com", None, UserTier::Pro, None)
			.await
			.unwrap();

		assert_eq!(service.servers_for(&free_user).await.unwrap().len(), 1);
		assert_eq!(service.servers_for(&pro_user).await.unwrap().len(), 2);
	}
}
