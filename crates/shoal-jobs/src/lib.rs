// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic background jobs for the Shoal daemons.
//!
//! Both daemons run work that must never happen inline with request
//! handling: the node samples its load scorer on a fixed cadence and the
//! authority runs fleet reconciliation sweeps. Jobs implement [`Job`] and
//! are registered on a [`JobScheduler`], which drives each one on its own
//! interval and shuts them all down over a broadcast channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum JobError {
	#[error("job not found: {0}")]
	NotFound(String),

	#[error("job failed: {0}")]
	Failed(String),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// A unit of recurring background work.
#[async_trait]
pub trait Job: Send + Sync {
	/// Stable identifier, used for triggering and logging.
	fn id(&self) -> &str;

	fn name(&self) -> &str;

	async fn run(&self) -> Result<()>;
}

/// Outcome of the most recent run, kept in memory for health reporting.
#[derive(Debug, Clone)]
pub struct LastRun {
	pub at: DateTime<Utc>,
	pub ok: bool,
	pub error: Option<String>,
}

struct RegisteredJob {
	job: Arc<dyn Job>,
	interval: Duration,
}

/// Drives registered jobs on their intervals until shutdown.
pub struct JobScheduler {
	jobs: HashMap<String, RegisteredJob>,
	last_runs: Arc<Mutex<HashMap<String, LastRun>>>,
	shutdown_tx: broadcast::Sender<()>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for JobScheduler {
	fn default() -> Self {
		Self::new()
	}
}

impl JobScheduler {
	pub fn new() -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			jobs: HashMap::new(),
			last_runs: Arc::new(Mutex::new(HashMap::new())),
			shutdown_tx,
			handles: Mutex::new(Vec::new()),
		}
	}

	pub fn register_periodic(&mut self, job: Arc<dyn Job>, interval: Duration) {
		let id = job.id().to_string();
		self.jobs.insert(id, RegisteredJob { job, interval });
	}

	pub fn job_ids(&self) -> Vec<String> {
		self.jobs.keys().cloned().collect()
	}

	/// Spawn one loop per registered job. Each loop sleeps its interval,
	/// runs the job, records the outcome, and exits on shutdown.
	#[instrument(skip(self))]
	pub async fn start(&self) {
		let mut handles = self.handles.lock().await;

		for (job_id, registered) in &self.jobs {
			let job = Arc::clone(&registered.job);
			let interval = registered.interval;
			let last_runs = Arc::clone(&self.last_runs);
			let mut shutdown_rx = self.shutdown_tx.subscribe();
			let job_id = job_id.clone();

			let handle = tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = tokio::time::sleep(interval) => {
							// Outcome is already recorded in last_runs.
							let _ = run_once(&job, &last_runs).await;
						}
						_ = shutdown_rx.recv() => {
							info!(job_id = %job_id, "shutting down periodic job");
							break;
						}
					}
				}
			});

			handles.push(handle);
		}

		info!(job_count = handles.len(), "job scheduler started");
	}

	/// Run a job immediately, outside its schedule.
	#[instrument(skip(self))]
	pub async fn trigger(&self, job_id: &str) -> Result<()> {
		let registered = self
			.jobs
			.get(job_id)
			.ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
		run_once(&registered.job, &self.last_runs).await
	}

	pub async fn last_run(&self, job_id: &str) -> Option<LastRun> {
		self.last_runs.lock().await.get(job_id).cloned()
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());

		let mut handles = self.handles.lock().await;
		for handle in handles.drain(..) {
			let _ = handle.await;
		}

		info!("job scheduler shut down");
	}
}

async fn run_once(job: &Arc<dyn Job>, last_runs: &Arc<Mutex<HashMap<String, LastRun>>>) -> Result<()> {
	let result = job.run().await;
	let record = match &result {
		Ok(()) => {
			info!(job_id = %job.id(), "job completed");
			LastRun {
				at: Utc::now(),
				ok: true,
				error: None,
			}
		}
		Err(e) => {
			warn!(job_id = %job.id(), error = %e, "job failed");
			LastRun {
				at: Utc::now(),
				ok: false,
				error: Some(e.to_string()),
			}
		}
	};
	last_runs.lock().await.insert(job.id().to_string(), record);
	result
}
