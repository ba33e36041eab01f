// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node HTTP API.
//!
//! `/api/ping` is the only public liveness endpoint. `/api/verify-user` is
//! payload-validated: knowing a valid (email, token) pair is the credential
//! itself. Everything else requires the fleet shared secret, as `Bearer` or
//! `X-Api-Key`.

use crate::registry::RegistryService;
use crate::report::LoadStatus;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shoal_common_token::secrets_match;
use shoal_common_types::{ApiResponse, ServerId, SyncEnvelope, UserTier, VpnTransport};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::instrument;

pub struct AppState {
	pub server_id: ServerId,
	pub transport: VpnTransport,
	pub fleet_secret: String,
	pub registry: RegistryService,
	pub status: Arc<LoadStatus>,
	pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/api/ping", get(ping))
		.route("/api/user-sync", post(user_sync))
		.route("/api/server-info", get(server_info))
		.route("/api/verify-user", post(verify_user))
		.route("/api/registry", get(registry_digest))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

struct Denied;

impl IntoResponse for Denied {
	fn into_response(self) -> Response {
		(
			StatusCode::UNAUTHORIZED,
			Json(ApiResponse::<()>::error("authentication required")),
		)
			.into_response()
	}
}

fn require_fleet(state: &AppState, headers: &HeaderMap) -> Result<(), Denied> {
	let presented = headers
		.get("authorization")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
		.or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));
	match presented {
		Some(secret) if secrets_match(&state.fleet_secret, secret) => Ok(()),
		_ => Err(Denied),
	}
}

#[derive(Debug, Serialize)]
struct PingBody {
	server_id: ServerId,
}

async fn ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	Json(ApiResponse::ok_with(
		"pong",
		PingBody {
			server_id: state.server_id.clone(),
		},
	))
}

#[instrument(skip_all)]
async fn user_sync(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(envelope): Json<SyncEnvelope>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}

	let report = state.registry.apply(&envelope).await;
	let response = ApiResponse {
		success: report.success,
		message: report.message.clone(),
		data: Some(report),
	};
	Json(response).into_response()
}

#[derive(Debug, Serialize)]
struct ServerInfo {
	server_id: ServerId,
	vpn_type: VpnTransport,
	active_connections: u32,
	load: u8,
	uptime_secs: u64,
	registered_users: u64,
}

#[instrument(skip_all)]
async fn server_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}

	let sample = state.status.latest().await;
	let registered_users = match state.registry.repository().count().await {
		Ok(count) => count,
		Err(e) => {
			tracing::error!(error = %e, "registry count failed");
			return (
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(ApiResponse::<()>::error("internal error")),
			)
				.into_response();
		}
	};

	let info = ServerInfo {
		server_id: state.server_id.clone(),
		vpn_type: state.transport,
		active_connections: sample.map(|s| s.active_connections).unwrap_or(0),
		load: sample.map(|s| s.score).unwrap_or(0),
		uptime_secs: state.started_at.elapsed().as_secs(),
		registered_users,
	};
	Json(ApiResponse::ok_with("server info", info)).into_response()
}

#[derive(Debug, Deserialize)]
struct VerifyUserRequest {
	/// The wire username, which is the user's email address.
	username: String,
	token: String,
}

#[derive(Debug, Serialize)]
struct VerifiedUser {
	user_id: i64,
	email: String,
	username: String,
	tier: UserTier,
}

#[instrument(skip_all)]
async fn verify_user(
	State(state): State<Arc<AppState>>,
	Json(request): Json<VerifyUserRequest>,
) -> Response {
	if request.username.trim().is_empty() || request.token.trim().is_empty() {
		return (
			StatusCode::BAD_REQUEST,
			Json(ApiResponse::<()>::error("username and token are required")),
		)
			.into_response();
	}

	match state.registry.verify(&request.username, &request.token).await {
		Ok(Some(entry)) => Json(ApiResponse::ok_with(
			"valid",
			VerifiedUser {
				user_id: entry.user_id,
				email: entry.email,
				username: entry.username,
				tier: entry.tier,
			},
		))
		.into_response(),
		Ok(None) => (
			StatusCode::UNAUTHORIZED,
			Json(ApiResponse::<()>::error("invalid credentials")),
		)
			.into_response(),
		Err(e) => {
			tracing::error!(error = %e, "verification failed");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(ApiResponse::<()>::error("internal error")),
			)
				.into_response()
		}
	}
}

#[instrument(skip_all)]
async fn registry_digest(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state.registry.digest().await {
		Ok(digest) => Json(digest).into_response(),
		Err(e) => {
			tracing::error!(error = %e, "digest failed");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(ApiResponse::<()>::error("internal error")),
			)
				.into_response()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::memory_pool;
	use crate::peers::testing::FakeBackend;
	use crate::peers::PeerBackend;
	use crate::registry::RegistryRepository;
	use chrono::Utc;
	use shoal_common_types::{SyncAction, UserSnapshot};

	const SECRET: &str = "fleet-secret";

	async fn spawn_node() -> String {
		let pool = memory_pool().await;
		let registry = RegistryService::new(
			RegistryRepository::new(pool),
			Arc::new(FakeBackend::default()) as Arc<dyn PeerBackend>,
		);
		let state = Arc::new(AppState {
			server_id: "de-01".parse().unwrap(),
			transport: VpnTransport::Wireguard,
			fleet_secret: SECRET.to_string(),
			registry,
			status: Arc::new(LoadStatus::default()),
			started_at: Instant::now(),
		});

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = router(state);
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		format!("http://{addr}")
	}

	fn envelope(action: SyncAction, token: &str) -> SyncEnvelope {
		SyncEnvelope {
			action,
			user: UserSnapshot {
				id: 7,
				email: "a@b.com".to_string(),
				username: "a@b.com".to_string(),
				token: token.to_string(),
				tier: UserTier::Free,
				created_at: Utc::now(),
				wg_public_key: None,
			},
			server_id: None,
		}
	}

	#[tokio::test]
	async fn ping_is_public_and_names_the_node() {
		let base = spawn_node().await;
		let response = reqwest::get(format!("{base}/api/ping")).await.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		assert_eq!(body.data.unwrap()["server_id"], "de-01");
	}

	#[tokio::test]
	async fn protected_routes_reject_without_secret() {
		let base = spawn_node().await;
		let client = reqwest::Client::new();

		for url in [
			format!("{base}/api/server-info"),
			format!("{base}/api/registry"),
		] {
			let response = client.get(&url).send().await.unwrap();
			assert_eq!(response.status(), 401, "{url}");
		}

		let response = client
			.post(format!("{base}/api/user-sync"))
			.bearer_auth("wrong")
			.json(&envelope(SyncAction::Add, "tok"))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 401);
	}

	#[tokio::test]
	async fn sync_then_verify_round_trip() {
		let base = spawn_node().await;
		let client = reqwest::Client::new();

		// Tokens on the wire are lowercase hex.
		let response = client
			.post(format!("{base}/api/user-sync"))
			.bearer_auth(SECRET)
			.json(&envelope(SyncAction::Add, "c0ffee01"))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		assert!(body.success);

		// verify-user is payload-only; no secret needed.
		let response = client
			.post(format!("{base}/api/verify-user"))
			.json(&serde_json::json!({"username": "a@b.com", "token": "c0ffee01"}))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		assert_eq!(body.data.unwrap()["user_id"], 7);

		let response = client
			.post(format!("{base}/api/verify-user"))
			.json(&serde_json::json!({"username": "a@b.com", "token": "c0ffee02"}))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 401);
	}

	#[tokio::test]
	async fn removing_an_unknown_user_reports_failure() {
		let base = spawn_node().await;
		let client = reqwest::Client::new();

		let response = client
			.post(format!("{base}/api/user-sync"))
			.bearer_auth(SECRET)
			.json(&envelope(SyncAction::Remove, "tok"))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		assert!(!body.success);
		assert_eq!(body.message, "not found");
	}

	#[tokio::test]
	async fn registry_digest_lists_synced_users() {
		let base = spawn_node().await;
		let client = reqwest::Client::new();

		client
			.post(format!("{base}/api/user-sync"))
			.bearer_auth(SECRET)
			.json(&envelope(SyncAction::Add, "tok"))
			.send()
			.await
			.unwrap();

		let response = client
			.get(format!("{base}/api/registry"))
			.header("x-api-key", SECRET)
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let digest: shoal_common_types::RegistryDigest = response.json().await.unwrap();
		assert_eq!(digest.entries.len(), 1);
		assert_eq!(digest.entries[0].entry_key, "user_7_a_b_com");
	}

	#[tokio::test]
	async fn server_info_reflects_the_latest_sample() {
		let base = spawn_node().await;
		let client = reqwest::Client::new();

		let response = client
			.get(format!("{base}/api/server-info"))
			.bearer_auth(SECRET)
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		let info = body.data.unwrap();
		assert_eq!(info["server_id"], "de-01");
		assert_eq!(info["vpn_type"], "wireguard");
		// No sample yet; load reads as zero.
		assert_eq!(info["load"], 0);
	}
}
