//! Slot supervision.
//!
//! Translates start/stop requests and hot-plug events into supervised
//! proxy-child lifecycles. Every transition for a slot runs to completion
//! under that slot's mutex, including the bounded polling waits, so
//! concurrent requests for the same slot queue instead of racing.

use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use serde::Serialize;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::slots::{Slot, SlotStore, DEFAULT_CONFIG_FILE, DEFAULT_LOCK_DIR, DEFAULT_LOG_DIR};

/// Candidate proxy executables, probed in order.
pub const PROXY_PATHS: [&str; 3] = [
	"/usr/local/bin/serial_proxy.py",
	"/usr/local/bin/serial-proxy",
	"/usr/local/bin/esp_rfc2217_server.py",
];

#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("Unknown slot_key")]
	UnknownSlot,
	#[error("No serial proxy executable found")]
	NoProxyExecutable,
	#[error("Device {} not ready after settle timeout", .0.display())]
	DeviceNotReady(PathBuf),
	#[error("Proxy exited immediately with code {code:?}")]
	ChildExitedEarly { code: Option<i32> },
	#[error("Proxy started but port not listening")]
	PortNotListening,
	#[error("Failed to spawn proxy: {0}")]
	Spawn(io::Error),
}

/// Timeout ladder for slot transitions.
#[derive(Debug, Clone)]
pub struct Timing {
	/// Settle check: total budget for the device to become openable.
	pub settle_timeout: Duration,
	pub settle_poll: Duration,
	/// Pause after spawn before checking for an early exit.
	pub spawn_grace: Duration,
	/// Port probe: attempts and pause between them.
	pub listen_attempts: u32,
	pub listen_poll: Duration,
	/// Per-attempt TCP connect timeout.
	pub connect_timeout: Duration,
	/// SIGTERM-to-SIGKILL grace and post-SIGKILL settle.
	pub term_timeout: Duration,
	pub kill_grace: Duration,
}

impl Default for Timing {
	fn default() -> Self {
		Self {
			settle_timeout: Duration::from_secs(5),
			settle_poll: Duration::from_millis(100),
			spawn_grace: Duration::from_millis(500),
			listen_attempts: 20,
			listen_poll: Duration::from_millis(100),
			connect_timeout: Duration::from_secs(1),
			term_timeout: Duration::from_secs(5),
			kill_grace: Duration::from_millis(500),
		}
	}
}

/// Everything the supervisor needs to come up.
#[derive(Debug, Clone)]
pub struct Settings {
	pub config_file: PathBuf,
	pub lock_dir: PathBuf,
	pub log_dir: PathBuf,
	pub proxy_paths: Vec<PathBuf>,
	pub timing: Timing,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
			lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
			log_dir: PathBuf::from(DEFAULT_LOG_DIR),
			proxy_paths: PROXY_PATHS.iter().map(PathBuf::from).collect(),
			timing: Timing::default(),
		}
	}
}

/// Successful start transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartOk {
	pub success: bool,
	pub running: bool,
	pub restarted: bool,
	pub port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pid: Option<u32>,
}

/// Successful stop transition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StopOk {
	pub success: bool,
	pub running: bool,
}

/// One slot as reported by `/api/devices`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
	pub label: String,
	pub slot_key: String,
	pub tcp_port: u16,
	pub running: bool,
	pub devnode: Option<String>,
	pub pid: Option<u32>,
	pub url: Option<String>,
	pub last_gen: u64,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicesSnapshot {
	pub slots: Vec<SlotSnapshot>,
	pub host_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalInfo {
	pub host_ip: String,
	pub config_file: String,
	pub slots_configured: usize,
	pub slots_running: usize,
}

/// A udev-style hot-plug event maps onto start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
	Add,
	Remove,
}

#[derive(Debug, Error)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for HotplugAction {
	type Err = UnknownAction;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"add" => Ok(Self::Add),
			"remove" => Ok(Self::Remove),
			other => Err(UnknownAction(other.to_owned())),
		}
	}
}

/// A validated hot-plug event; `add` always carries a devnode.
#[derive(Debug, Clone, Copy)]
pub enum HotplugEvent<'a> {
	Add { devnode: &'a Path },
	Remove,
}

/// Outcome of a dispatched hot-plug event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HotplugOk {
	Started(StartOk),
	Stopped(StopOk),
}

/// Owns the slot store and the proxy children.
pub struct Supervisor {
	store: SlotStore,
	host_ip: IpAddr,
	config_file: PathBuf,
	log_dir: PathBuf,
	proxy_paths: Vec<PathBuf>,
	timing: Timing,
}

impl Supervisor {
	/// Creates the lock and log directories (0755), determines the host
	/// address and loads the slot configuration.
	pub fn new(settings: Settings) -> io::Result<Self> {
		for dir in [&settings.lock_dir, &settings.log_dir] {
			fs::create_dir_all(dir)?;
			fs::set_permissions(dir, Permissions::from_mode(0o755))?;
		}

		let store = SlotStore::load(&settings.config_file, &settings.lock_dir);
		Ok(Self {
			store,
			host_ip: detect_host_ip(),
			config_file: settings.config_file,
			log_dir: settings.log_dir,
			proxy_paths: settings.proxy_paths,
			timing: settings.timing,
		})
	}

	pub fn host_ip(&self) -> IpAddr {
		self.host_ip
	}

	/// Idempotent start. A healthy child on the same devnode is left
	/// alone; anything else is stopped and replaced. The generation
	/// counter moves on every call, success or not.
	pub fn start(&self, slot_key: &str, devnode: &Path) -> Result<StartOk, SupervisorError> {
		let Some(slot) = self.store.get(slot_key) else {
			warn!("unknown slot_key: {slot_key}");
			return Err(SupervisorError::UnknownSlot);
		};

		let mut state = slot.lock();
		state.last_gen += 1;

		if state.running && state.pid.is_some() && state.devnode.as_deref() == Some(devnode) {
			let alive = state.child.as_mut().is_some_and(child_alive);
			if alive && self.port_listening(slot.tcp_port) {
				info!("{}: already running on {}", slot.label, devnode.display());
				return Ok(StartOk {
					success: true,
					running: true,
					restarted: false,
					port: slot.tcp_port,
					pid: state.pid,
				});
			}
		}

		if state.running {
			if let Some(mut child) = state.child.take() {
				info!("{}: stopping existing proxy (pid {})", slot.label, child.id());
				self.stop_child(&mut child);
			}
			state.running = false;
			state.pid = None;
		}

		info!(
			"{}: starting proxy for {} on port {}",
			slot.label,
			devnode.display(),
			slot.tcp_port
		);
		match self.start_proxy(slot, devnode) {
			Ok(child) => {
				let pid = child.id();
				state.running = true;
				state.pid = Some(pid);
				state.child = Some(child);
				state.devnode = Some(devnode.to_owned());
				state.last_error = None;
				info!("{}: started (pid {pid})", slot.label);
				Ok(StartOk {
					success: true,
					running: true,
					restarted: true,
					port: slot.tcp_port,
					pid: Some(pid),
				})
			}
			Err(err) => {
				state.running = false;
				state.pid = None;
				state.child = None;
				state.devnode = None;
				state.last_error = Some(err.to_string());
				error!("{}: failed to start: {err}", slot.label);
				Err(err)
			}
		}
	}

	/// Idempotent stop. Returns only after the child is gone from the
	/// process table.
	pub fn stop(&self, slot_key: &str) -> Result<StopOk, SupervisorError> {
		let Some(slot) = self.store.get(slot_key) else {
			warn!("unknown slot_key: {slot_key}");
			return Err(SupervisorError::UnknownSlot);
		};

		let mut state = slot.lock();
		state.last_gen += 1;

		if !state.running || state.pid.is_none() {
			info!("{}: already stopped", slot.label);
			return Ok(StopOk {
				success: true,
				running: false,
			});
		}

		if let Some(mut child) = state.child.take() {
			info!("{}: stopping proxy (pid {})", slot.label, child.id());
			self.stop_child(&mut child);
		}
		state.running = false;
		state.pid = None;
		state.devnode = None;
		state.last_error = None;

		Ok(StopOk {
			success: true,
			running: false,
		})
	}

	/// Dispatches a hot-plug event: `add` starts, `remove` stops.
	pub fn hotplug(
		&self,
		slot_key: &str,
		event: HotplugEvent<'_>,
	) -> Result<HotplugOk, SupervisorError> {
		match event {
			HotplugEvent::Add { devnode } => {
				self.start(slot_key, devnode).map(HotplugOk::Started)
			}
			HotplugEvent::Remove => self.stop(slot_key).map(HotplugOk::Stopped),
		}
	}

	/// Snapshot of all slots. Dead children found here are reaped and
	/// recorded as `"Process died"`.
	pub fn get_devices(&self) -> DevicesSnapshot {
		let slots = self
			.store
			.iter()
			.map(|slot| {
				let mut state = slot.lock();
				if state.running && !state.child.as_mut().is_some_and(child_alive) {
					state.running = false;
					state.pid = None;
					state.child = None;
					state.devnode = None;
					state.last_error = Some("Process died".to_owned());
				}

				SlotSnapshot {
					label: slot.label.clone(),
					slot_key: slot.slot_key.clone(),
					tcp_port: slot.tcp_port,
					running: state.running,
					devnode: state
						.devnode
						.as_ref()
						.map(|path| path.display().to_string()),
					pid: state.pid,
					url: state
						.running
						.then(|| format!("rfc2217://{}:{}", self.host_ip, slot.tcp_port)),
					last_gen: state.last_gen,
					last_error: state.last_error.clone(),
				}
			})
			.collect();

		DevicesSnapshot {
			slots,
			host_ip: self.host_ip.to_string(),
		}
	}

	pub fn info(&self) -> PortalInfo {
		let slots_running = self
			.store
			.iter()
			.filter(|slot| slot.lock().running)
			.count();
		PortalInfo {
			host_ip: self.host_ip.to_string(),
			config_file: self.config_file.display().to_string(),
			slots_configured: self.store.len(),
			slots_running,
		}
	}

	/// Settle check, executable probe, spawn, early-exit check, port
	/// probe. Called with the slot mutex held.
	fn start_proxy(&self, slot: &Slot, devnode: &Path) -> Result<Child, SupervisorError> {
		if !self.wait_for_device(devnode) {
			return Err(SupervisorError::DeviceNotReady(devnode.to_owned()));
		}

		let proxy_exe = self
			.find_proxy_executable()
			.ok_or(SupervisorError::NoProxyExecutable)?;

		let mut command = Command::new(&proxy_exe);
		command.arg("-p").arg(slot.tcp_port.to_string());
		if supports_log_dir(&proxy_exe) {
			command.arg("-l").arg(&self.log_dir);
		}
		command.arg(devnode);
		command.stdout(Stdio::null()).stderr(Stdio::null());
		// Detach into its own session so terminal signals aimed at the
		// portal never reach the child.
		unsafe {
			command.pre_exec(|| {
				unistd::setsid().map_err(io::Error::from)?;
				Ok(())
			});
		}

		let mut child = command.spawn().map_err(SupervisorError::Spawn)?;

		thread::sleep(self.timing.spawn_grace);
		match child.try_wait() {
			Ok(Some(status)) => {
				return Err(SupervisorError::ChildExitedEarly {
					code: status.code(),
				});
			}
			Ok(None) => {}
			Err(err) => return Err(SupervisorError::Spawn(err)),
		}

		for _ in 0..self.timing.listen_attempts {
			if self.port_listening(slot.tcp_port) {
				return Ok(child);
			}
			thread::sleep(self.timing.listen_poll);
		}

		// Alive but unreachable; take it back down before surfacing.
		self.stop_child(&mut child);
		Err(SupervisorError::PortNotListening)
	}

	/// Polls the devnode until a nonblocking read-write open succeeds.
	fn wait_for_device(&self, devnode: &Path) -> bool {
		let deadline = Instant::now() + self.timing.settle_timeout;
		loop {
			if devnode.exists() {
				let opened = OpenOptions::new()
					.read(true)
					.write(true)
					.custom_flags(nix::libc::O_NONBLOCK)
					.open(devnode);
				if opened.is_ok() {
					return true;
				}
			}
			if Instant::now() >= deadline {
				return false;
			}
			thread::sleep(self.timing.settle_poll);
		}
	}

	fn find_proxy_executable(&self) -> Option<&Path> {
		self.proxy_paths
			.iter()
			.map(PathBuf::as_path)
			.find(|path| path.exists())
	}

	fn port_listening(&self, port: u16) -> bool {
		let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
		TcpStream::connect_timeout(&addr, self.timing.connect_timeout).is_ok()
	}

	/// SIGTERM, bounded wait, then SIGKILL. A process that is already
	/// gone counts as stopped.
	fn stop_child(&self, child: &mut Child) -> bool {
		let pid = Pid::from_raw(child.id() as i32);
		if signal::kill(pid, Signal::SIGTERM).is_err() {
			child.try_wait().ok();
			return true;
		}

		match child.wait_timeout(self.timing.term_timeout) {
			Ok(Some(_)) => return true,
			Ok(None) => {}
			Err(err) => warn!("waiting for pid {pid} failed: {err}"),
		}

		child.kill().ok();
		matches!(child.wait_timeout(self.timing.kill_grace), Ok(Some(_)))
	}
}

fn child_alive(child: &mut Child) -> bool {
	matches!(child.try_wait(), Ok(None))
}

/// The `-l` flag is understood only by logging-capable proxies, detected
/// by their basename.
fn supports_log_dir(exe: &Path) -> bool {
	exe.file_name()
		.and_then(|name| name.to_str())
		.is_some_and(|name| name.contains("serial_proxy"))
}

/// Routes a UDP socket toward a public address to learn which local
/// address faces outward. No packet is sent. Falls back to loopback.
fn detect_host_ip() -> IpAddr {
	let probe = || -> io::Result<IpAddr> {
		let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
		socket.connect(("8.8.8.8", 80))?;
		Ok(socket.local_addr()?.ip())
	};
	probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
