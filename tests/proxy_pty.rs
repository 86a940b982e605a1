//! End-to-end proxy tests over a pseudo-terminal pair.
//!
//! The pty slave stands in for the USB tty: what the proxy writes to the
//! "serial line" shows up on the master, and master writes look like
//! device output.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::IntoRawFd;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

use portal::proxy::ProxyServer;

const IAC: u8 = 255;
const WILL: u8 = 251;
const DO: u8 = 253;
const COM_PORT_OPTION: u8 = 44;

fn open_pty() -> (File, PathBuf) {
	let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK).unwrap();
	grantpt(&master).unwrap();
	unlockpt(&master).unwrap();
	let path = PathBuf::from(ptsname_r(&master).unwrap());
	let file = unsafe { File::from_raw_fd(master.into_raw_fd()) };
	(file, path)
}

struct RunningProxy {
	shutdown: Arc<AtomicBool>,
	port: u16,
	handle: Option<thread::JoinHandle<()>>,
}

impl RunningProxy {
	fn spawn(devnode: &Path, log_dir: &Path) -> Self {
		let shutdown = Arc::new(AtomicBool::new(false));
		let mut server =
			ProxyServer::bind(devnode, 0, 115_200, log_dir, Arc::clone(&shutdown)).unwrap();
		let port = server.port();
		let handle = thread::spawn(move || server.run().unwrap());
		Self {
			shutdown,
			port,
			handle: Some(handle),
		}
	}

	fn connect(&self) -> TcpStream {
		let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_millis(200)))
			.unwrap();
		stream
	}

	fn stop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.handle.take() {
			handle.join().unwrap();
		}
	}
}

impl Drop for RunningProxy {
	fn drop(&mut self) {
		self.shutdown.store(true, Ordering::Relaxed);
		if let Some(handle) = self.handle.take() {
			handle.join().ok();
		}
	}
}

/// Collects up to `want` bytes from a nonblocking reader within `timeout`.
fn read_for<R: Read>(reader: &mut R, want: usize, timeout: Duration) -> Vec<u8> {
	let deadline = Instant::now() + timeout;
	let mut out = Vec::new();
	let mut buf = [0u8; 256];
	while out.len() < want && Instant::now() < deadline {
		match reader.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => out.extend_from_slice(&buf[..n]),
			Err(err)
				if err.kind() == std::io::ErrorKind::WouldBlock
					|| err.kind() == std::io::ErrorKind::TimedOut
					|| err.kind() == std::io::ErrorKind::Interrupted =>
			{
				thread::sleep(Duration::from_millis(20));
			}
			Err(err) => panic!("read failed: {err}"),
		}
	}
	out
}

/// Waits until a read returns EOF, which is how a pre-empted client sees
/// its socket being closed.
fn wait_for_eof(stream: &mut TcpStream, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	let mut buf = [0u8; 64];
	while Instant::now() < deadline {
		match stream.read(&mut buf) {
			Ok(0) => return true,
			Ok(_) => {}
			Err(err)
				if err.kind() == std::io::ErrorKind::WouldBlock
					|| err.kind() == std::io::ErrorKind::TimedOut =>
			{
				thread::sleep(Duration::from_millis(20));
			}
			// A reset also means the old session is gone.
			Err(_) => return true,
		}
	}
	false
}

fn log_contents(log_dir: &Path) -> String {
	let mut text = String::new();
	for entry in fs::read_dir(log_dir).unwrap() {
		let path = entry.unwrap().path();
		if path.extension().is_some_and(|ext| ext == "log") {
			text.push_str(&fs::read_to_string(path).unwrap());
		}
	}
	text
}

#[test]
fn bridges_escaped_data_both_ways() {
	let log_dir = tempfile::tempdir().unwrap();
	let (mut master, pts) = open_pty();
	let mut proxy = RunningProxy::spawn(&pts, log_dir.path());

	let mut client = proxy.connect();

	// IAC-escaped 0xFF reaches the serial line as one literal byte.
	client.write_all(&[0x41, IAC, IAC, 0x42]).unwrap();
	assert_eq!(
		read_for(&mut master, 3, Duration::from_secs(2)),
		[0x41, 0xff, 0x42]
	);

	// Device output is forwarded verbatim to the client.
	master.write_all(b"boot ok\n").unwrap();
	assert_eq!(
		read_for(&mut client, 8, Duration::from_secs(2)),
		b"boot ok\n"
	);

	proxy.stop();
}

#[test]
fn answers_com_port_negotiation() {
	let log_dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let mut proxy = RunningProxy::spawn(&pts, log_dir.path());

	let mut client = proxy.connect();
	client.write_all(&[IAC, DO, COM_PORT_OPTION]).unwrap();
	assert_eq!(
		read_for(&mut client, 3, Duration::from_secs(2)),
		[IAC, WILL, COM_PORT_OPTION]
	);

	proxy.stop();
}

#[test]
fn new_client_preempts_old_session() {
	let log_dir = tempfile::tempdir().unwrap();
	let (mut master, pts) = open_pty();
	let mut proxy = RunningProxy::spawn(&pts, log_dir.path());

	// Client A is connected, then B takes over.
	let mut client_a = proxy.connect();
	client_a.write_all(b"from-a").unwrap();
	assert_eq!(
		read_for(&mut master, 6, Duration::from_secs(2)),
		b"from-a"
	);

	let mut client_b = proxy.connect();
	assert!(
		wait_for_eof(&mut client_a, Duration::from_secs(2)),
		"old session must be closed on pre-emption"
	);

	// Subsequent serial traffic reaches only B.
	master.write_all(b"for-b\n").unwrap();
	assert_eq!(
		read_for(&mut client_b, 6, Duration::from_secs(2)),
		b"for-b\n"
	);

	proxy.stop();

	let log = log_contents(log_dir.path());
	assert!(log.contains("Previous client disconnected (new connection)"));
	assert!(log.contains("Client connected from"));
	assert!(log.contains("Shutting down"));
	assert!(log.contains("=== Log closed ==="));
}

#[test]
fn logs_traffic_in_both_directions() {
	let log_dir = tempfile::tempdir().unwrap();
	let (mut master, pts) = open_pty();
	let mut proxy = RunningProxy::spawn(&pts, log_dir.path());

	let mut client = proxy.connect();
	client.write_all(b"AT+RST\r\n").unwrap();
	assert_eq!(
		read_for(&mut master, 8, Duration::from_secs(2)),
		b"AT+RST\r\n"
	);
	master.write_all(b"ready\n").unwrap();
	assert_eq!(read_for(&mut client, 6, Duration::from_secs(2)), b"ready\n");

	proxy.stop();

	let log = log_contents(log_dir.path());
	assert!(log.contains("[TX] AT+RST"));
	assert!(log.contains("[RX] ready"));
	assert!(log.contains("Listening on port"));
}
