// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic load reporting to the authority.
//!
//! Sampling runs only here, on the job cadence, never inline with request
//! handling: a bandwidth sample blocks for half a second, which no request
//! should pay for. The latest sample is kept in [`LoadStatus`] for the
//! `/api/server-info` endpoint.

use crate::metrics::MetricsProvider;
use crate::scorer::{LoadSample, LoadScorer};
use async_trait::async_trait;
use serde::Serialize;
use shoal_common_types::ServerId;
use shoal_jobs::{Job, JobError};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Latest sample, shared between the report job and the HTTP surface.
#[derive(Default)]
pub struct LoadStatus {
	latest: RwLock<Option<LoadSample>>,
}

impl LoadStatus {
	pub async fn latest(&self) -> Option<LoadSample> {
		*self.latest.read().await
	}

	async fn store(&self, sample: LoadSample) {
		*self.latest.write().await = Some(sample);
	}
}

#[derive(Debug, Serialize)]
struct LoadReportBody {
	load: u8,
	active_connections: u32,
}

pub struct LoadReportJob<M> {
	scorer: LoadScorer<M>,
	status: Arc<LoadStatus>,
	http: reqwest::Client,
	authority_url: String,
	server_id: ServerId,
	fleet_secret: String,
}

impl<M: MetricsProvider> LoadReportJob<M> {
	pub fn new(
		scorer: LoadScorer<M>,
		status: Arc<LoadStatus>,
		authority_url: String,
		server_id: ServerId,
		fleet_secret: String,
	) -> Self {
		LoadReportJob {
			scorer,
			status,
			http: shoal_common_http::new_client(),
			authority_url: authority_url.trim_end_matches('/').to_string(),
			server_id,
			fleet_secret,
		}
	}
}

#[async_trait]
impl<M: MetricsProvider + 'static> Job for LoadReportJob<M> {
	fn id(&self) -> &str {
		"load-report"
	}

	fn name(&self) -> &str {
		"Load Report"
	}

	async fn run(&self) -> shoal_jobs::Result<()> {
		let sample = self.scorer.sample().await;
		self.status.store(sample).await;

		tracing::debug!(
			score = sample.score,
			connections = sample.active_connections,
			"sampled load"
		);

		let url = format!("{}/api/servers/{}/load", self.authority_url, self.server_id);
		let response = self
			.http
			.post(&url)
			.bearer_auth(&self.fleet_secret)
			.json(&LoadReportBody {
				load: sample.score,
				active_connections: sample.active_connections,
			})
			.send()
			.await
			.map_err(|e| JobError::Failed(format!("report failed: {e}")))?;

		if !response.status().is_success() {
			return Err(JobError::Failed(format!(
				"authority refused load report: {}",
				response.status()
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics::testing::FixedMetrics;
	use crate::scorer::LoadWeights;
	use axum::extract::Path;
	use axum::routing::post;
	use axum::{Json, Router};
	use shoal_common_types::ApiResponse;
	use std::sync::Mutex;

	#[tokio::test]
	async fn job_posts_the_sampled_score_and_updates_status() {
		let received: Arc<Mutex<Vec<(String, serde_json::Value)>>> =
			Arc::new(Mutex::new(Vec::new()));
		let sink = received.clone();
		let router = Router::new().route(
			"/api/servers/{id}/load",
			post(move |Path(id): Path<String>, Json(body): Json<serde_json::Value>| {
				sink.lock().unwrap().push((id, body));
				async move { Json(ApiResponse::<()>::ok("load recorded")) }
			}),
		);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, router).await.unwrap();
		});

		let status = Arc::new(LoadStatus::default());
		let job = LoadReportJob::new(
			LoadScorer::new(
				FixedMetrics {
					connections: 50,
					bandwidth: 60.0,
					system: 50.0,
				},
				LoadWeights::default(),
				100,
			),
			status.clone(),
			format!("http://{addr}"),
			"de-01".parse().unwrap(),
			"secret".to_string(),
		);

		job.run().await.unwrap();

		let posts = received.lock().unwrap().clone();
		assert_eq!(posts.len(), 1);
		assert_eq!(posts[0].0, "de-01");
		assert_eq!(posts[0].1["load"], 44);
		assert_eq!(posts[0].1["active_connections"], 50);

		let latest = status.latest().await.unwrap();
		assert_eq!(latest.score, 44);
	}

	#[tokio::test]
	async fn unreachable_authority_is_a_job_failure() {
		let status = Arc::new(LoadStatus::default());
		let job = LoadReportJob::new(
			LoadScorer::new(
				FixedMetrics {
					connections: 0,
					bandwidth: 0.0,
					system: 0.0,
				},
				LoadWeights::default(),
				100,
			),
			status.clone(),
			"http://127.0.0.1:1".to_string(),
			"de-01".parse().unwrap(),
			"secret".to_string(),
		);

		assert!(job.run().await.is_err());
		// The sample itself still landed in the shared status.
		assert!(status.latest().await.is_some());
	}
}
