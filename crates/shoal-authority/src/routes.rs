// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authority HTTP API.
//!
//! Three auth levels:
//! - public: `/health` only
//! - user: `Authorization: Bearer <api key>`, resolved to a directory user
//! - fleet: the shared secret, as `Bearer` or `X-Api-Key`; used by nodes
//!   and by the admin mutation endpoints.

use crate::directory::{ServerPatch, UserPatch};
use crate::error::AuthorityError;
use crate::service::{AuthorityService, SyncReport};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shoal_common_token::secrets_match;
use shoal_common_types::{
	ApiResponse, Server, ServerFeatures, ServerId, ServerStatus, User, UserTier, VpnTransport,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

pub struct AppState {
	pub service: AuthorityService,
	pub fleet_secret: String,
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/api/servers", get(list_servers).post(create_server))
		.route(
			"/api/servers/{id}",
			get(get_server).patch(update_server).delete(delete_server),
		)
		.route("/api/servers/{id}/config", get(server_config))
		.route("/api/servers/{id}/load", post(report_load))
		.route("/api/users", post(create_user))
		.route(
			"/api/users/{id}",
			get(get_user).patch(update_user).delete(delete_user),
		)
		.route("/api/verify-credentials", post(verify_credentials))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

impl IntoResponse for AuthorityError {
	fn into_response(self) -> Response {
		let status = match &self {
			AuthorityError::UserNotFound(_) | AuthorityError::ServerNotFound(_) => {
				StatusCode::NOT_FOUND
			}
			AuthorityError::AccessDenied(_) => StatusCode::FORBIDDEN,
			AuthorityError::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			AuthorityError::Db(_) | AuthorityError::InvalidRecord(_) | AuthorityError::Internal(_) => {
				tracing::error!(error = %self, "request failed");
				StatusCode::INTERNAL_SERVER_ERROR
			}
		};
		let message = match status {
			// Never leak internals to the client.
			StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
			_ => self.to_string(),
		};
		(status, Json(ApiResponse::<()>::error(message))).into_response()
	}
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

fn bearer(headers: &HeaderMap) -> Option<&str> {
	headers
		.get("authorization")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
}

/// Shared-secret check for node and admin calls.
fn require_fleet(state: &AppState, headers: &HeaderMap) -> Result<(), Denied> {
	let presented = bearer(headers).or_else(|| {
		headers.get("x-api-key").and_then(|v| v.to_str().ok())
	});
	match presented {
		Some(secret) if secrets_match(&state.fleet_secret, secret) => Ok(()),
		_ => Err(Denied),
	}
}

/// Resolve the bearer token to a directory user.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<User, Response> {
	let Some(key) = bearer(headers) else {
		return Err(Denied.into_response());
	};
	match state.service.users.find_by_api_key(key).await {
		Ok(Some(user)) => Ok(user),
		Ok(None) => Err(Denied.into_response()),
		Err(e) => Err(e.into_response()),
	}
}

async fn health() -> impl IntoResponse {
	Json(ApiResponse::<()>::ok("ok"))
}

/// The server projection handed to clients; no transport internals.
#[derive(Debug, Serialize)]
struct ServerListing {
	id: ServerId,
	name: String,
	domain: String,
	exit_country: String,
	entry_country: Option<String>,
	city: Option<String>,
	tier: UserTier,
	features: Vec<&'static str>,
	transport: VpnTransport,
	load: u8,
}

impl From<Server> for ServerListing {
	fn from(server: Server) -> Self {
		ServerListing {
			id: server.id,
			name: server.name,
			domain: server.domain,
			exit_country: server.exit_country,
			entry_country: server.entry_country,
			city: server.city,
			tier: server.tier,
			features: server.features.labels(),
			transport: server.transport,
			load: server.load,
		}
	}
}

#[instrument(skip_all)]
async fn list_servers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
	let user = match require_user(&state, &headers).await {
		Ok(user) => user,
		Err(response) => return response,
	};
	match state.service.servers_for(&user).await {
		Ok(servers) => {
			let listings: Vec<ServerListing> = servers.into_iter().map(Into::into).collect();
			Json(ApiResponse::ok_with("servers", listings)).into_response()
		}
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
	format: Option<String>,
	#[serde(default)]
	sync: bool,
}

#[instrument(skip_all, fields(%id))]
async fn server_config(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<ServerId>,
	Query(query): Query<ConfigQuery>,
) -> Response {
	let user = match require_user(&state, &headers).await {
		Ok(user) => user,
		Err(response) => return response,
	};

	let (bundle, outcome) = match state.service.issue_bundle(&user, &id, query.sync).await {
		Ok(issued) => issued,
		Err(e) => return e.into_response(),
	};
	if let Some(outcome) = &outcome {
		if !outcome.is_acked() {
			tracing::warn!(server_id = %id, ?outcome, "on-demand push failed");
		}
	}

	// Unknown format values fall back to the structured record; a format
	// the server's transport cannot serve is a client error.
	match query.format.as_deref() {
		Some("ovpn") => {
			if bundle.transport != VpnTransport::Openvpn {
				return format_mismatch("ovpn", bundle.transport);
			}
			plain_text(bundle.config)
		}
		Some("wireguard") => {
			if bundle.transport != VpnTransport::Wireguard {
				return format_mismatch("wireguard", bundle.transport);
			}
			plain_text(bundle.config)
		}
		_ => Json(ApiResponse::ok_with("config", bundle)).into_response(),
	}
}

fn plain_text(body: String) -> Response {
	([(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

fn format_mismatch(requested: &str, transport: VpnTransport) -> Response {
	(
		StatusCode::BAD_REQUEST,
		Json(ApiResponse::<()>::error(format!(
			"format {requested} not available for a {} server",
			transport.as_str()
		))),
	)
		.into_response()
}

#[derive(Debug, Deserialize)]
struct VerifyCredentialsRequest {
	email: String,
	server_id: ServerId,
	token: String,
}

#[instrument(skip_all)]
async fn verify_credentials(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<VerifyCredentialsRequest>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state
		.service
		.verify_credentials(&request.email, &request.server_id, &request.token)
		.await
	{
		Ok(snapshot) => Json(ApiResponse::ok_with("valid", snapshot)).into_response(),
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct LoadReport {
	load: i64,
	#[allow(dead_code)]
	active_connections: Option<u64>,
}

#[instrument(skip_all, fields(%id))]
async fn report_load(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<ServerId>,
	Json(report): Json<LoadReport>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	let load = report.load.clamp(0, 100) as u8;
	match state.service.record_load(&id, load).await {
		Ok(()) => Json(ApiResponse::<()>::ok("load recorded")).into_response(),
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
	email: String,
	username: Option<String>,
	tier: UserTier,
	api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserWithSync {
	user: User,
	sync: SyncReport,
}

#[instrument(skip_all)]
async fn create_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<CreateUserRequest>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	if request.email.trim().is_empty() || !request.email.contains('@') {
		return (
			StatusCode::BAD_REQUEST,
			Json(ApiResponse::<()>::error("invalid email")),
		)
			.into_response();
	}
	match state
		.service
		.create_user(
			&request.email,
			request.username.as_deref(),
			request.tier,
			request.api_key.as_deref(),
		)
		.await
	{
		Ok((user, sync)) => (
			StatusCode::CREATED,
			Json(ApiResponse::ok_with("user created", UserWithSync { user, sync })),
		)
			.into_response(),
		Err(e) => e.into_response(),
	}
}

#[instrument(skip_all, fields(user_id = id))]
async fn get_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<i64>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state.service.users.get(id).await {
		Ok(Some(user)) => Json(ApiResponse::ok_with("user", user)).into_response(),
		Ok(None) => AuthorityError::UserNotFound(id.to_string()).into_response(),
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
	email: Option<String>,
	// Nested options distinguish "leave alone" from "clear".
	#[serde(default, with = "serde_double_option")]
	username: Option<Option<String>>,
	tier: Option<UserTier>,
	#[serde(default, with = "serde_double_option")]
	api_key: Option<Option<String>>,
}

/// `field: null` clears, absent field leaves untouched.
mod serde_double_option {
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
	where
		T: Deserialize<'de>,
		D: Deserializer<'de>,
	{
		Option::<T>::deserialize(deserializer).map(Some)
	}
}

#[instrument(skip_all, fields(user_id = id))]
async fn update_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<i64>,
	Json(request): Json<UpdateUserRequest>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	let patch = UserPatch {
		email: request.email,
		username: request.username,
		tier: request.tier,
		api_key: request.api_key,
	};
	match state.service.update_user(id, patch).await {
		Ok((user, sync)) => Json(ApiResponse::ok_with(
			"user updated",
			UserWithSync {
				user,
				sync: sync.unwrap_or_default(),
			},
		))
		.into_response(),
		Err(e) => e.into_response(),
	}
}

#[instrument(skip_all, fields(user_id = id))]
async fn delete_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<i64>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state.service.delete_user(id).await {
		Ok(sync) => Json(ApiResponse::ok_with("user deleted", sync)).into_response(),
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct CreateServerRequest {
	exit_country: String,
	domain: String,
	tier: UserTier,
	#[serde(default)]
	features: ServerFeatures,
	transport: VpnTransport,
	city: Option<String>,
}

#[instrument(skip_all)]
async fn create_server(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(request): Json<CreateServerRequest>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	let country = request.exit_country.trim().to_lowercase();
	if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
		return (
			StatusCode::BAD_REQUEST,
			Json(ApiResponse::<()>::error("exit_country must be a 2-letter code")),
		)
			.into_response();
	}
	match state
		.service
		.create_server(
			&country,
			&request.domain,
			request.tier,
			request.features,
			request.transport,
			request.city.as_deref(),
		)
		.await
	{
		Ok(server) => (
			StatusCode::CREATED,
			Json(ApiResponse::ok_with("server created", server)),
		)
			.into_response(),
		Err(e) => e.into_response(),
	}
}

#[instrument(skip_all, fields(%id))]
async fn get_server(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<ServerId>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state.service.servers.get(&id).await {
		Ok(Some(server)) => Json(ApiResponse::ok_with("server", server)).into_response(),
		Ok(None) => AuthorityError::ServerNotFound(id).into_response(),
		Err(e) => e.into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct UpdateServerRequest {
	domain: Option<String>,
	status: Option<u8>,
	tier: Option<UserTier>,
	features: Option<ServerFeatures>,
	#[serde(default, with = "serde_double_option")]
	city: Option<Option<String>>,
}

#[instrument(skip_all, fields(%id))]
async fn update_server(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<ServerId>,
	Json(request): Json<UpdateServerRequest>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	let status = match request.status {
		Some(code) => match ServerStatus::from_code(code) {
			Some(status) => Some(status),
			None => {
				return (
					StatusCode::BAD_REQUEST,
					Json(ApiResponse::<()>::error(format!("unknown status code {code}"))),
				)
					.into_response()
			}
		},
		None => None,
	};
	let patch = ServerPatch {
		domain: request.domain,
		status,
		tier: request.tier,
		features: request.features,
		city: request.city,
	};
	match state.service.update_server(&id, patch).await {
		Ok(server) => Json(ApiResponse::ok_with("server updated", server)).into_response(),
		Err(e) => e.into_response(),
	}
}

#[instrument(skip_all, fields(%id))]
async fn delete_server(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<ServerId>,
) -> Response {
	if let Err(denied) = require_fleet(&state, &headers) {
		return denied.into_response();
	}
	match state.service.delete_server(&id).await {
		Ok(()) => Json(ApiResponse::<()>::ok("server deleted")).into_response(),
		Err(e) => e.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::ConfigCache;
	use crate::db::memory_pool;
	use crate::directory::{ServerRepository, UserRepository};
	use crate::sync::FleetSyncCoordinator;
	use std::time::Duration;

	const SECRET: &str = "fleet-secret";

	async fn spawn_authority() -> (String, Arc<AppState>) {
		let pool = memory_pool().await;
		let users = UserRepository::new(pool.clone());
		let servers = ServerRepository::new(pool);
		let sync = FleetSyncCoordinator::new(
			servers.clone(),
			SECRET.to_string(),
			Duration::from_millis(200),
			4,
		)
		.with_plain_http();
		let service = AuthorityService::new(
			users,
			servers,
			Arc::new(ConfigCache::new(Duration::from_secs(3600))),
			sync,
			SECRET.to_string(),
		);
		let state = Arc::new(AppState {
			service,
			fleet_secret: SECRET.to_string(),
		});

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = router(state.clone());
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		(format!("http://{addr}"), state)
	}

	#[tokio::test]
	async fn health_is_public() {
		let (base, _) = spawn_authority().await;
		let response = reqwest::get(format!("{base}/health")).await.unwrap();
		assert_eq!(response.status(), 200);
	}

	#[tokio::test]
	async fn server_listing_requires_a_user_key() {
		let (base, _) = spawn_authority().await;
		let client = reqwest::Client::new();

		let response = client
			.get(format!("{base}/api/servers"))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 401);

		let response = client
			.get(format!("{base}/api/servers"))
			.bearer_auth("not-a-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 401);
	}

	#[tokio::test]
	async fn mutation_endpoints_require_the_fleet_secret() {
		let (base, _) = spawn_authority().await;
		let client = reqwest::Client::new();

		let body = serde_json::json!({
			"email": "a@b.com",
			"tier": 1,
		});

		let response = client
			.post(format!("{base}/api/users"))
			.json(&body)
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 401);

		// X-Api-Key works as well as Bearer.
		let response = client
			.post(format!("{base}/api/users"))
			.header("x-api-key", SECRET)
			.json(&body)
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 201);
	}

	#[tokio::test]
	async fn client_flow_list_and_fetch_config() {
		let (base, state) = spawn_authority().await;
		let client = reqwest::Client::new();

		let server = state
			.service
			.create_server("de", "unused.example.net", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		state
			.service
			.update_server(
				&server.id,
				ServerPatch {
					status: Some(ServerStatus::Online),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let (user, _) = state
			.service
			.create_user("a@b.com", None, UserTier::Free, Some("user-key"))
			.await
			.unwrap();

		let response = client
			.get(format!("{base}/api/servers"))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<Vec<serde_json::Value>> = response.json().await.unwrap();
		assert_eq!(body.data.unwrap().len(), 1);

		let response = client
			.get(format!("{base}/api/servers/{}/config", server.id))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		let body: ApiResponse<serde_json::Value> = response.json().await.unwrap();
		let bundle = body.data.unwrap();
		assert_eq!(bundle["server_id"], server.id.as_str());
		assert!(bundle["client_id"]
			.as_str()
			.unwrap()
			.starts_with(&format!("shoal-{}-{}-", user.id, server.id)));

		// Text format for the matching transport.
		let response = client
			.get(format!("{base}/api/servers/{}/config?format=wireguard", server.id))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);
		assert!(response.text().await.unwrap().contains("[Interface]"));

		// Transport-gated format is a client error.
		let response = client
			.get(format!("{base}/api/servers/{}/config?format=ovpn", server.id))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 400);
	}

	#[tokio::test]
	async fn load_report_round_trips_into_the_listing() {
		let (base, state) = spawn_authority().await;
		let client = reqwest::Client::new();

		let server = state
			.service
			.create_server("de", "unused.example.net", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		state
			.service
			.update_server(
				&server.id,
				ServerPatch {
					status: Some(ServerStatus::Online),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let response = client
			.post(format!("{base}/api/servers/{}/load", server.id))
			.bearer_auth(SECRET)
			.json(&serde_json::json!({"load": 250, "active_connections": 12}))
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 200);

		// Out-of-range report was clamped.
		let stored = state.service.servers.get(&server.id).await.unwrap().unwrap();
		assert_eq!(stored.load, 100);
	}

	#[tokio::test]
	async fn tier_gate_returns_403_offline_returns_503() {
		let (base, state) = spawn_authority().await;
		let client = reqwest::Client::new();

		let pro = state
			.service
			.create_server("de", "unused.example.net", UserTier::Pro, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		state
			.service
			.update_server(
				&pro.id,
				ServerPatch {
					status: Some(ServerStatus::Online),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let offline = state
			.service
			.create_server("us", "unused2.example.net", UserTier::Free, ServerFeatures::NONE, VpnTransport::Wireguard, None)
			.await
			.unwrap();
		state
			.service
			.create_user("a@b.com", None, UserTier::Free, Some("user-key"))
			.await
			.unwrap();

		let response = client
			.get(format!("{base}/api/servers/{}/config", pro.id))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 403);

		let response = client
			.get(format!("{base}/api/servers/{}/config", offline.id))
			.bearer_auth("user-key")
			.send()
			.await
			.unwrap();
		assert_eq!(response.status(), 503);
	}
}
