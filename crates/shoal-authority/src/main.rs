// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shoal fleet authority binary.

use clap::Parser;
use shoal_authority::cache::ConfigCache;
use shoal_authority::directory::{ServerRepository, UserRepository};
use shoal_authority::reconcile::ReconcileJob;
use shoal_authority::routes::{router, AppState};
use shoal_authority::sync::FleetSyncCoordinator;
use shoal_authority::AuthorityService;
use shoal_jobs::JobScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shoal authority - directory, config issuance and fleet sync.
#[derive(Parser, Debug)]
#[command(name = "shoal-authority", about = "Shoal fleet authority", version)]
struct Args {
	/// Path to a TOML config file.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Talk plain HTTP to nodes instead of HTTPS (development only).
	#[arg(long)]
	plain_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config = shoal_authority::load_config(args.config.as_deref())?;

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	tracing::info!(
		host = %config.http.host,
		port = config.http.port,
		database = %config.database.url,
		"starting shoal-authority"
	);

	let pool = shoal_authority::db::create_pool(&config.database.url).await?;
	shoal_authority::db::run_migrations(&pool).await?;

	let users = UserRepository::new(pool.clone());
	let servers = ServerRepository::new(pool.clone());
	let cache = Arc::new(ConfigCache::new(Duration::from_secs(
		config.cache.ttl_minutes * 60,
	)));

	let mut sync = FleetSyncCoordinator::new(
		servers.clone(),
		config.fleet_secret.clone(),
		Duration::from_secs(config.sync.timeout_secs),
		config.sync.max_in_flight,
	);
	if args.plain_http {
		tracing::warn!("talking plain HTTP to nodes");
		sync = sync.with_plain_http();
	}

	let service = AuthorityService::new(
		users.clone(),
		servers.clone(),
		cache,
		sync.clone(),
		config.fleet_secret.clone(),
	);

	// Periodic reconciliation closes the gaps best-effort pushes leave.
	let mut scheduler = JobScheduler::new();
	let mut reconcile = ReconcileJob::new(
		users,
		servers,
		sync,
		config.fleet_secret.clone(),
		Duration::from_secs(config.sync.timeout_secs),
	);
	if args.plain_http {
		reconcile = reconcile.with_plain_http();
	}
	scheduler.register_periodic(
		Arc::new(reconcile),
		Duration::from_secs(config.jobs.reconcile_interval_secs),
	);
	scheduler.start().await;

	let state = Arc::new(AppState {
		service,
		fleet_secret: config.fleet_secret.clone(),
	});
	let app = router(state);

	let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
	tracing::info!(addr = %listener.local_addr()?, "listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	scheduler.shutdown().await;
	tracing::info!("shoal-authority stopped");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		tracing::error!(error = %e, "failed to listen for shutdown signal");
	}
}
