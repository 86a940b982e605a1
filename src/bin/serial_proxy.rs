//! RFC2217-compatible serial proxy with traffic logging.
//!
//! Bridges one serial device and one TCP client, logging both directions.
//! DTR/RTS control is forwarded, which is what lets esptool reset an
//! ESP32 into its bootloader through the proxy.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use clap::Parser;
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use portal::proxy::ProxyServer;
use portal::serial::DEFAULT_BAUDRATE;
use portal::slots::DEFAULT_LOG_DIR;

/// Serial proxy with logging.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Serial device (e.g., /dev/ttyUSB0).
	device: PathBuf,

	/// TCP port to listen on.
	#[arg(short, long, default_value_t = 4001)]
	port: u16,

	/// Baud rate.
	#[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
	baudrate: u32,

	/// Directory for device traffic logs.
	#[arg(short = 'l', long, default_value = DEFAULT_LOG_DIR)]
	log_dir: PathBuf,
}

fn shutdown_flag() -> Arc<AtomicBool> {
	static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
	Arc::clone(FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))))
}

extern "C" fn on_signal(_signal: i32) {
	shutdown_flag().store(true, Ordering::Relaxed);
}

/// SIGTERM and SIGINT raise the shutdown flag; the proxy loop unwinds
/// gracefully on the next tick.
fn install_signal_handlers() -> Result<()> {
	let action = SigAction::new(
		SigHandler::Handler(on_signal),
		SaFlags::empty(),
		SigSet::empty(),
	);
	unsafe {
		signal::sigaction(Signal::SIGTERM, &action)?;
		signal::sigaction(Signal::SIGINT, &action)?;
	}
	Ok(())
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
	let cli = Cli::parse();

	let shutdown = shutdown_flag();
	install_signal_handlers()?;

	let mut server = ProxyServer::bind(
		&cli.device,
		cli.port,
		cli.baudrate,
		&cli.log_dir,
		shutdown,
	)?;
	server.run()?;

	info!("shut down");
	Ok(())
}
