// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-user, per-server connection bundles.
//!
//! A bundle carries everything a client needs to connect to one exit node:
//! the derived credential token, a freshly generated WireGuard keypair or
//! OpenVPN profile, and the rendered config text for the node's transport.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shoal_common_token::derive_token;
use shoal_common_types::{Server, User, VpnTransport};
use shoal_common_wg::{client_address, WgKeyPair};
use std::net::Ipv4Addr;

const BUNDLE_LIFETIME_DAYS: i64 = 7;
const WIREGUARD_PORT: u16 = 51820;
const OPENVPN_PORT: u16 = 1194;

/// Connection material issued to one user for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBundle {
	/// Stable-prefix client identifier with a random tail, unique per issue.
	pub client_id: String,
	pub server_id: String,
	pub server_name: String,
	pub endpoint: String,
	pub transport: VpnTransport,
	/// Credential the node will verify on connect.
	pub token: String,
	/// Tunnel-interior address assigned to this client.
	pub client_address: Ipv4Addr,
	pub issued_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	/// Rendered client configuration for the server's transport.
	pub config: String,
	/// Client's WireGuard private key, present only for WireGuard bundles.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub wg_private_key: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub wg_public_key: Option<String>,
}

impl ConfigBundle {
	pub fn is_expired(&self) -> bool {
		Utc::now() >= self.expires_at
	}
}

/// Build a fresh bundle. WireGuard bundles get a real X25519 keypair; the
/// public half is what the node registers as the peer key.
pub fn build_bundle(user: &User, server: &Server, fleet_secret: &str) -> ConfigBundle {
	let token = derive_token(user, &server.id, fleet_secret);
	let client_address = client_address(user.id);
	let issued_at = Utc::now();
	let expires_at = issued_at + Duration::days(BUNDLE_LIFETIME_DAYS);
	let client_id = client_id(user.id, server.id.as_str());

	let (endpoint, config, wg_private_key, wg_public_key) = match server.transport {
		VpnTransport::Wireguard => {
			let keys = WgKeyPair::generate();
			let endpoint = format!("{}:{}", server.domain, WIREGUARD_PORT);
			let config = render_wireguard(&keys, client_address, &endpoint);
			(
				endpoint,
				config,
				Some(keys.private_base64()),
				Some(keys.public_key().to_base64()),
			)
		}
		VpnTransport::Openvpn => {
			let endpoint = format!("{}:{}", server.domain, OPENVPN_PORT);
			let config = render_openvpn(&server.domain, &user.email, &token);
			(endpoint, config, None, None)
		}
	};

	ConfigBundle {
		client_id,
		server_id: server.id.as_str().to_string(),
		server_name: server.name.clone(),
		endpoint,
		transport: server.transport,
		token,
		client_address,
		issued_at,
		expires_at,
		config,
		wg_private_key,
		wg_public_key,
	}
}

/// `shoal-<user>-<server>-<8 alphanumeric>`; the random tail makes every
/// issue distinguishable in node logs.
fn client_id(user_id: i64, server_id: &str) -> String {
	const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
	let mut rng = rand::thread_rng();
	let suffix: String = (0..8)
		.map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
		.collect();
	format!("shoal-{user_id}-{server_id}-{suffix}")
}

fn render_wireguard(keys: &WgKeyPair, client_address: Ipv4Addr, endpoint: &str) -> String {
	format!(
		"[Interface]\n\
		 PrivateKey = {private}\n\
		 Address = {client_address}/32\n\
		 DNS = 1.1.1.1\n\
		 \n\
		 [Peer]\n\
		 PublicKey = {public}\n\
		 Endpoint = {endpoint}\n\
		 AllowedIPs = 0.0.0.0/0\n\
		 PersistentKeepalive = 25\n",
		private = keys.private_base64(),
		public = keys.public_key().to_base64(),
	)
}

fn render_openvpn(domain: &str, email: &str, token: &str) -> String {
	format!(
		"client\n\
		 dev tun\n\
		 proto udp\n\
		 remote {domain} {OPENVPN_PORT}\n\
		 resolv-retry infinite\n\
		 nobind\n\
		 persist-key\n\
		 persist-tun\n\
		 cipher AES-256-GCM\n\
		 auth SHA256\n\
		 verb 3\n\
		 auth-user-pass\n\
		 # username: {email}\n\
		 # password: {token}\n",
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use shoal_common_types::{ServerFeatures, ServerStatus, UserTier};

	fn test_user() -> User {
		User {
			id: 7,
			email: "a@b.com".to_string(),
			username: Some("alice".to_string()),
			tier: UserTier::Plus,
			api_key: Some("key-1".to_string()),
			created_at: Utc::now(),
		}
	}

	fn test_server(transport: VpnTransport) -> Server {
		Server {
			id: "de-01".parse().unwrap(),
			name: "DE#1".to_string(),
			domain: "de-01.example.net".to_string(),
			exit_country: "de".to_string(),
			entry_country: None,
			city: None,
			status: ServerStatus::Online,
			tier: UserTier::Free,
			features: ServerFeatures::ALL,
			transport,
			load: 10,
		}
	}

	#[test]
	fn wireguard_bundle_carries_keypair() {
		let bundle = build_bundle(&test_user(), &test_server(VpnTransport::Wireguard), "secret");
		assert!(bundle.wg_private_key.is_some());
		assert!(bundle.wg_public_key.is_some());
		assert!(bundle.config.contains("[Interface]"));
		assert!(bundle.config.contains("de-01.example.net:51820"));
		assert_eq!(bundle.endpoint, "de-01.example.net:51820");
		assert_eq!(bundle.client_address, Ipv4Addr::new(10, 8, 0, 8));
		assert!(!bundle.is_expired());
	}

	#[test]
	fn openvpn_bundle_has_no_wireguard_keys() {
		let bundle = build_bundle(&test_user(), &test_server(VpnTransport::Openvpn), "secret");
		assert!(bundle.wg_private_key.is_none());
		assert!(bundle.config.contains("remote de-01.example.net 1194"));
		assert!(bundle.config.contains("cipher AES-256-GCM"));
		assert!(bundle.config.contains(&bundle.token));
	}

	#[test]
	fn client_ids_are_prefixed_and_distinct() {
		let a = client_id(7, "de-01");
		let b = client_id(7, "de-01");
		assert!(a.starts_with("shoal-7-de-01-"));
		assert_eq!(a.len(), "shoal-7-de-01-".len() + 8);
		assert_ne!(a, b);
	}

	#[test]
	fn token_matches_direct_derivation() {
		let user = test_user();
		let server = test_server(VpnTransport::Wireguard);
		let bundle = build_bundle(&user, &server, "secret");
		assert_eq!(bundle.token, derive_token(&user, &server.id, "secret"));
	}
}
