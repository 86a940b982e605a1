//! Slot supervisor daemon with the RFC2217 portal HTTP API.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use portal::http;
use portal::slots::{CONFIG_ENV, DEFAULT_CONFIG_FILE};
use portal::supervisor::{Settings, Supervisor};

/// RFC2217 portal: supervises per-slot serial proxies.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Slot configuration file; falls back to $RFC2217_CONFIG.
	config: Option<PathBuf>,

	/// HTTP API port.
	#[arg(long, default_value_t = http::HTTP_PORT)]
	http_port: u16,
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
	let cli = Cli::parse();

	let config_file = cli
		.config
		.or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
		.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

	let supervisor = Arc::new(Supervisor::new(Settings {
		config_file,
		..Settings::default()
	})?);

	info!("portal started on http://0.0.0.0:{}", cli.http_port);
	info!("host ip: {}", supervisor.host_ip());

	http::serve(supervisor, cli.http_port)?;
	Ok(())
}
