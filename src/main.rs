pub(crate) mod config;
pub(crate) mod db;
pub(crate) mod dimse;
pub(crate) mod types;
pub(crate) mod worklist;

use crate::config::AppConfig;
use crate::db::WorklistDataSource;
use crate::dimse::scp::WorklistServiceClassProvider;
use crate::worklist::WorklistEngine;
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(directive: &str) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(directive.parse().unwrap_or_else(|_| LevelFilter::INFO.into()))
				.from_env_lossy(),
		)
		.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(&config.logging.level);

	if let Err(error) = run(config).await {
		error!("Failed to start application due to error: {error:#}");
		std::process::exit(-1);
	}
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let source = WorklistDataSource::new(config.database);
	let engine = Arc::new(WorklistEngine::new(
		source,
		config.server.client_aet.clone(),
	));

	// Startup is aborted if the database is unreachable or misconfigured.
	// Transient failures during operation are retried per query instead.
	engine
		.connect()
		.await
		.context("Failed to connect to the worklist database")?;
	info!("Connected to the worklist database");

	let scp = WorklistServiceClassProvider::new(Arc::clone(&engine), config.server);
	tokio::select! {
		result = scp.spawn() => result,
		() = shutdown_signal() => {
			info!("Shutting down");
			Ok(())
		}
	}
}

async fn shutdown_signal() {
	let ctrl_c = async { signal::ctrl_c().await.unwrap() };

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.unwrap()
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}
