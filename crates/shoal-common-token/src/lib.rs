// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deterministic connection-token derivation.
//!
//! A token is `HMAC-SHA256(secret, base)` where `base` is the user's
//! pre-issued API key when one exists, otherwise a fallback derived from
//! `SHA256(email || user_id || server_id || secret)`. The derivation is a
//! pure function: any party holding the shared authority secret can
//! recompute the token independently, so a node verifies an inbound login
//! without a round trip to the authority.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use shoal_common_types::{ServerId, User};

type HmacSha256 = Hmac<Sha256>;

/// Derive the connection token for one (user, server) pair.
///
/// Deterministic for fixed inputs; never fails (HMAC-SHA256 accepts keys of
/// any length). Returned as lowercase hex.
pub fn derive_token(user: &User, server_id: &ServerId, secret: &str) -> String {
	let base = match &user.api_key {
		Some(api_key) => api_key.clone(),
		None => fallback_base(&user.email, user.id, server_id, secret),
	};

	let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
		.expect("hmac-sha256 accepts any key length");
	mac.update(base.as_bytes());
	hex::encode(mac.finalize().into_bytes())
}

/// Compare a presented token against the expected one in constant time.
///
/// Malformed hex rejects without panicking. The comparison goes through
/// `Mac::verify_slice`, which is constant-time over the tag bytes.
pub fn verify_token(user: &User, server_id: &ServerId, secret: &str, presented: &str) -> bool {
	let Ok(presented_raw) = hex::decode(presented) else {
		return false;
	};

	let base = match &user.api_key {
		Some(api_key) => api_key.clone(),
		None => fallback_base(&user.email, user.id, server_id, secret),
	};

	let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
		.expect("hmac-sha256 accepts any key length");
	mac.update(base.as_bytes());
	mac.verify_slice(&presented_raw).is_ok()
}

/// Constant-time equality over two hex-encoded tokens.
///
/// Used node-side where only the stored token string is available and the
/// user record cannot be recomputed from.
pub fn tokens_match(expected_hex: &str, presented_hex: &str) -> bool {
	let (Ok(expected), Ok(presented)) = (hex::decode(expected_hex), hex::decode(presented_hex))
	else {
		return false;
	};
	constant_time_eq(&expected, &presented)
}

/// Constant-time equality over raw secrets that are not hex, such as the
/// fleet shared secret presented on node and admin requests.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
	constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
	if expected.len() != presented.len() {
		return false;
	}
	// Fold the comparison so the loop shape does not depend on content.
	let diff = expected
		.iter()
		.zip(presented.iter())
		.fold(0u8, |acc, (a, b)| acc | (a ^ b));
	diff == 0
}

fn fallback_base(email: &str, user_id: i64, server_id: &ServerId, secret: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(email.as_bytes());
	hasher.update(user_id.to_string().as_bytes());
	hasher.update(server_id.as_str().as_bytes());
	hasher.update(secret.as_bytes());
	hex::encode(hasher.finalize())
}
