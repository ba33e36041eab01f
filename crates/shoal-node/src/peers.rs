// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transport peer plumbing.
//!
//! The registry talks to the tunnel through [`PeerBackend`] so its logic is
//! testable without a kernel interface. The production backend shells out
//! to `wg`; OpenVPN nodes use [`NullBackend`] because OpenVPN authenticates
//! per connection and keeps no peer list.

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use shoal_common_wg::{PeerSpec, WgPublicKey};
use tokio::process::Command;

#[async_trait]
pub trait PeerBackend: Send + Sync {
	/// Add the peer, or update it in place when the key is already present.
	async fn ensure_peer(&self, spec: &PeerSpec) -> Result<()>;

	async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<()>;

	async fn list_peers(&self) -> Result<Vec<WgPublicKey>>;
}

/// Drives a kernel WireGuard interface via the `wg` tool.
pub struct WgCliBackend {
	interface: String,
}

impl WgCliBackend {
	pub fn new(interface: impl Into<String>) -> Self {
		WgCliBackend {
			interface: interface.into(),
		}
	}

	async fn wg(&self, args: &[&str]) -> Result<String> {
		let output = Command::new("wg")
			.args(args)
			.output()
			.await
			.map_err(|e| NodeError::Peer(format!("failed to run wg: {e}")))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(NodeError::Peer(format!(
				"wg {} failed: {}",
				args.first().unwrap_or(&""),
				stderr.trim()
			)));
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

#[async_trait]
impl PeerBackend for WgCliBackend {
	#[tracing::instrument(skip(self, spec), fields(interface = %self.interface))]
	async fn ensure_peer(&self, spec: &PeerSpec) -> Result<()> {
		// `wg set ... peer` upserts, so ensure and update are the same call.
		let key = spec.public_key.to_base64();
		let allowed = format!("{}/32", spec.allowed_ip);
		let keepalive = spec.persistent_keepalive.to_string();
		self.wg(&[
			"set",
			&self.interface,
			"peer",
			&key,
			"allowed-ips",
			&allowed,
			"persistent-keepalive",
			&keepalive,
		])
		.await?;
		Ok(())
	}

	#[tracing::instrument(skip(self, public_key), fields(interface = %self.interface))]
	async fn remove_peer(&self, public_key: &WgPublicKey) -> Result<()> {
		let key = public_key.to_base64();
		self.wg(&["set", &self.interface, "peer", &key, "remove"]).await?;
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(interface = %self.interface))]
	async fn list_peers(&self) -> Result<Vec<WgPublicKey>> {
		let stdout = self.wg(&["show", &self.interface, "peers"]).await?;
		Ok(stdout
			.lines()
			.filter(|line| !line.trim().is_empty())
			.filter_map(|line| WgPublicKey::from_base64(line.trim()).ok())
			.collect())
	}
}

/// Peer backend for transports without a peer list.
pub struct NullBackend;

#[async_trait]
impl PeerBackend for NullBackend {
	async fn ensure_peer(&self, _spec: &PeerSpec) -> Result<()> {
		Ok(())
	}

	async fn remove_peer(&self, _public_key: &WgPublicKey) -> Result<()> {
		Ok(())
	}

	async fn list_peers(&self) -> Result<Vec<WgPublicKey>> {
		Ok(Vec::new())
	}
}
