// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shoal exit-node binary.

use clap::Parser;
use shoal_common_types::VpnTransport;
use shoal_jobs::JobScheduler;
use shoal_node::metrics::SystemMetricsProvider;
use shoal_node::peers::{NullBackend, PeerBackend, WgCliBackend};
use shoal_node::registry::{RegistryRepository, RegistryService};
use shoal_node::report::{LoadReportJob, LoadStatus};
use shoal_node::routes::{router, AppState};
use shoal_node::scorer::{LoadScorer, LoadWeights};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shoal exit node - registry, verification and load reporting.
#[derive(Parser, Debug)]
#[command(name = "shoal-noded", about = "Shoal exit-node daemon", version)]
struct Args {
	/// Path to a TOML config file.
	#[arg(short, long)]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config = shoal_node::load_config(args.config.as_deref())?;

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	tracing::info!(
		server_id = %config.server_id,
		transport = config.transport.as_str(),
		host = %config.http.host,
		port = config.http.port,
		"starting shoal-noded"
	);

	let pool = shoal_node::db::create_pool(&config.database.url).await?;
	shoal_node::db::run_migrations(&pool).await?;

	let peers: Arc<dyn PeerBackend> = match config.transport {
		VpnTransport::Wireguard => Arc::new(WgCliBackend::new(&config.interfaces.wireguard)),
		VpnTransport::Openvpn => Arc::new(NullBackend),
	};
	let registry = RegistryService::new(RegistryRepository::new(pool), peers);

	let status = Arc::new(LoadStatus::default());
	let scorer = LoadScorer::new(
		SystemMetricsProvider::new(
			config.transport,
			&config.interfaces.wireguard,
			&config.interfaces.network,
		),
		LoadWeights {
			connections: config.load.connection_weight,
			bandwidth: config.load.bandwidth_weight,
			system: config.load.system_weight,
		},
		config.load.max_connections,
	);

	let mut scheduler = JobScheduler::new();
	scheduler.register_periodic(
		Arc::new(LoadReportJob::new(
			scorer,
			status.clone(),
			config.authority_url.clone(),
			config.server_id.clone(),
			config.fleet_secret.clone(),
		)),
		Duration::from_secs(config.load.report_interval_secs),
	);
	scheduler.start().await;

	let state = Arc::new(AppState {
		server_id: config.server_id.clone(),
		transport: config.transport,
		fleet_secret: config.fleet_secret.clone(),
		registry,
		status,
		started_at: Instant::now(),
	});
	let app = router(state);

	let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
	tracing::info!(addr = %listener.local_addr()?, "listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	scheduler.shutdown().await;
	tracing::info!("shoal-noded stopped");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		tracing::error!(error = %e, "failed to listen for shutdown signal");
	}
}
