// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard key material and peer types.
//!
//! Keypairs are real X25519 pairs. A hash-of-ids scheme cannot produce a
//! valid curve keypair, so every generated key goes through
//! `x25519_dalek::StaticSecret` and the operating-system RNG.

pub mod keys;
pub mod peer;

pub use keys::{KeyError, WgKeyPair, WgPublicKey};
pub use peer::{client_address, PeerSpec};
