// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One entry in a node's transport peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
	pub public_key: WgPublicKey,
	/// /32 tunnel address assigned to this user.
	pub allowed_ip: Ipv4Addr,
	pub persistent_keepalive: u16,
}

impl PeerSpec {
	pub fn for_user(public_key: WgPublicKey, user_id: i64) -> Self {
		PeerSpec {
			public_key,
			allowed_ip: client_address(user_id),
			persistent_keepalive: 25,
		}
	}
}

/// Tunnel address for a user, `10.8.0.(id mod 254 + 1)`.
pub fn client_address(user_id: i64) -> Ipv4Addr {
	let octet = (user_id.rem_euclid(254) + 1) as u8;
	Ipv4Addr::new(10, 8, 0, octet)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;

	#[test]
	fn client_addresses_stay_in_the_tunnel_subnet() {
		assert_eq!(client_address(1), Ipv4Addr::new(10, 8, 0, 2));
		assert_eq!(client_address(254), Ipv4Addr::new(10, 8, 0, 1));
		assert_eq!(client_address(0), Ipv4Addr::new(10, 8, 0, 1));
		for id in [1i64, 253, 254, 255, 1000, i64::MAX] {
			let octet = client_address(id).octets()[3];
			assert!((1..=254).contains(&octet));
		}
	}

	#[test]
	fn peer_spec_defaults_keepalive() {
		let key = WgKeyPair::generate().public_key();
		let spec = PeerSpec::for_user(key, 7);
		assert_eq!(spec.persistent_keepalive, 25);
		assert_eq!(spec.allowed_ip, Ipv4Addr::new(10, 8, 0, 8));
	}
}
