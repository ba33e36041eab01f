// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Composite load score.
//!
//! `score = round(clamp(w_c·conn% + w_b·(bw%·0.5) + w_s·sys%, 0, 100))`
//!
//! The bandwidth term is halved before weighting: short bursts saturate a
//! link long before they saturate the node, so raw utilization overstates
//! pressure. Weights come from config and are applied as-is, without
//! renormalization.

use crate::metrics::MetricsProvider;

const BANDWIDTH_DAMPING: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct LoadWeights {
	pub connections: f64,
	pub bandwidth: f64,
	pub system: f64,
}

impl Default for LoadWeights {
	fn default() -> Self {
		LoadWeights {
			connections: 0.5,
			bandwidth: 0.3,
			system: 0.2,
		}
	}
}

/// One sampled measurement and the score derived from it.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
	pub score: u8,
	pub active_connections: u32,
	pub connection_percent: f64,
	pub bandwidth_percent: f64,
	pub system_percent: f64,
}

pub struct LoadScorer<M> {
	metrics: M,
	weights: LoadWeights,
	max_connections: u32,
}

impl<M: MetricsProvider> LoadScorer<M> {
	pub fn new(metrics: M, weights: LoadWeights, max_connections: u32) -> Self {
		LoadScorer {
			metrics,
			weights,
			max_connections: max_connections.max(1),
		}
	}

	#[tracing::instrument(skip(self))]
	pub async fn sample(&self) -> LoadSample {
		let active_connections = self.metrics.active_connections().await;
		let bandwidth_percent = self.metrics.bandwidth_percent().await;
		let system_percent = self.metrics.system_load_percent().await;

		let connection_percent =
			(active_connections as f64 / self.max_connections as f64 * 100.0).min(100.0);

		let score = compute_score(
			self.weights,
			connection_percent,
			bandwidth_percent,
			system_percent,
		);

		LoadSample {
			score,
			active_connections,
			connection_percent,
			bandwidth_percent,
			system_percent,
		}
	}
}

pub fn compute_score(weights: LoadWeights, conn_pct: f64, bw_pct: f64, sys_pct: f64) -> u8 {
	let raw = weights.connections * conn_pct
		+ weights.bandwidth * (bw_pct * BANDWIDTH_DAMPING)
		+ weights.system * sys_pct;
	raw.clamp(0.0, 100.0).round() as u8
}
