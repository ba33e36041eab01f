// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::prelude::*;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid base64 key: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("invalid key length: expected 32 bytes, got {0}")]
	Length(usize),
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// An X25519 public key in WireGuard's standard base64 encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WgPublicKey([u8; 32]);

impl WgPublicKey {
	pub fn from_base64(encoded: &str) -> Result<Self> {
		let raw = BASE64_STANDARD.decode(encoded.trim())?;
		let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| KeyError::Length(v.len()))?;
		Ok(WgPublicKey(bytes))
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

/// A freshly generated X25519 keypair for one (user, server) pair.
///
/// The private half is handed to the client exactly once and never stored
/// on either the authority or the node.
pub struct WgKeyPair {
	secret: StaticSecret,
	public: PublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		let public = PublicKey::from(&secret);
		WgKeyPair { secret, public }
	}

	pub fn from_private_base64(encoded: &str) -> Result<Self> {
		let raw = BASE64_STANDARD.decode(encoded.trim())?;
		let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| KeyError::Length(v.len()))?;
		let secret = StaticSecret::from(bytes);
		let public = PublicKey::from(&secret);
		Ok(WgKeyPair { secret, public })
	}

	pub fn public_key(&self) -> WgPublicKey {
		WgPublicKey(*self.public.as_bytes())
	}

	pub fn private_base64(&self) -> String {
		BASE64_STANDARD.encode(self.secret.to_bytes())
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Never print the private half.
		f.debug_struct("WgKeyPair")
			.field("public", &self.public_key().to_base64())
			.finish_non_exhaustive()
	}
}
