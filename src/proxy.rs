//! RFC 2217 proxy engine.
//!
//! One TCP listener, one serial line, at most one client. The main loop
//! multiplexes readiness over the three descriptors with a 100 ms tick; a
//! freshly accepted connection pre-empts the current session.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::codec::{
	self, encode_com_port, Event, FrameCodec, CONTROL_DTR_OFF, CONTROL_DTR_ON, CONTROL_RTS_OFF,
	CONTROL_RTS_ON, RESPONSE_OFFSET,
};
use crate::devlog::{DeviceInfo, DeviceLog, Direction};
use crate::serial::{LinePort, Parity, SerialError, SerialGate, StopBits};

/// Loop tick, also the serial read poll budget.
const TICK_MILLIS: u8 = 100;

/// Upper bound for a single client read.
const CLIENT_READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error(transparent)]
	Serial(#[from] SerialError),
	#[error("failed to bind TCP port {port}: {source}")]
	Bind { port: u16, source: io::Error },
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// One connected client.
struct Session {
	stream: TcpStream,
	peer: SocketAddr,
	codec: FrameCodec,
}

/// The per-slot proxy child: serial line on one side, a single RFC 2217
/// client on the other.
pub struct ProxyServer {
	listener: TcpListener,
	gate: SerialGate,
	log: DeviceLog,
	session: Option<Session>,
	shutdown: Arc<AtomicBool>,
	port: u16,
	/// Last serial read error, deduplicated so an unplugged device does
	/// not flood the log at tick rate.
	serial_error: Option<String>,
}

impl ProxyServer {
	/// Opens the serial device, creates the device log and binds the TCP
	/// port. `shutdown` is polled every tick; signal handlers set it.
	pub fn bind(
		devnode: &Path,
		port: u16,
		baudrate: u32,
		log_dir: &Path,
		shutdown: Arc<AtomicBool>,
	) -> Result<Self, ProxyError> {
		let gate = SerialGate::open(devnode, baudrate)?;

		let info = DeviceInfo::probe(devnode);
		let mut log = DeviceLog::create(log_dir, devnode, &info)?;
		log.event(&format!("Opened {} at {baudrate} baud", devnode.display()))?;

		// std sets SO_REUSEADDR on unix listeners.
		let listener = TcpListener::bind(("0.0.0.0", port))
			.map_err(|source| ProxyError::Bind { port, source })?;
		listener.set_nonblocking(true)?;
		let port = listener.local_addr()?.port();

		Ok(Self {
			listener,
			gate,
			log,
			session: None,
			shutdown,
			port,
			serial_error: None,
		})
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn device_name(&self) -> &str {
		self.log.device_name()
	}

	/// Serves until the shutdown flag is raised, then closes the session,
	/// the listener, the serial line and the device log.
	pub fn run(&mut self) -> Result<(), ProxyError> {
		self.log.event(&format!("Listening on port {}", self.port))?;
		info!(
			"serial proxy for {} listening on port {}",
			self.gate.path().display(),
			self.port
		);

		while !self.shutdown.load(Ordering::Relaxed) {
			self.tick()?;
		}

		self.log.event("Shutting down").ok();
		self.session = None;
		self.log.close().ok();
		Ok(())
	}

	fn tick(&mut self) -> Result<(), ProxyError> {
		let listener_fd = self.listener.as_fd();
		let mut fds = Vec::with_capacity(3);
		fds.push(PollFd::new(listener_fd, PollFlags::POLLIN));
		if let Some(session) = &self.session {
			fds.push(PollFd::new(session.stream.as_fd(), PollFlags::POLLIN));
		}
		fds.push(PollFd::new(self.gate.as_fd(), PollFlags::POLLIN));

		match poll(&mut fds, PollTimeout::from(TICK_MILLIS)) {
			// A signal landed; the loop condition picks the flag up.
			Err(Errno::EINTR) => return Ok(()),
			Err(err) => return Err(io::Error::from(err).into()),
			Ok(0) => return Ok(()),
			Ok(_) => {}
		}

		let ready = |fd: &PollFd<'_>| {
			fd.revents()
				.is_some_and(|revents| revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
		};
		let listener_ready = ready(&fds[0]);
		let client_ready = self.session.is_some() && ready(&fds[1]);
		let serial_ready = ready(fds.last().unwrap());
		drop(fds);

		if listener_ready {
			self.accept();
		}
		if client_ready {
			self.service_client();
		}
		if serial_ready {
			self.service_serial();
		}
		Ok(())
	}

	/// Accepts a connection, pre-empting any current session. Whatever the
	/// old session's codec had buffered goes away with it.
	fn accept(&mut self) {
		let (stream, peer) = match self.listener.accept() {
			Ok(accepted) => accepted,
			Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
			Err(err) => {
				warn!("accept failed: {err}");
				return;
			}
		};

		if self.session.take().is_some() {
			self.log
				.event("Previous client disconnected (new connection)")
				.ok();
		}

		if let Err(err) = stream.set_nonblocking(true) {
			warn!("failed to make client socket nonblocking: {err}");
			return;
		}

		self.log
			.event(&format!("Client connected from {}:{}", peer.ip(), peer.port()))
			.ok();
		self.session = Some(Session {
			stream,
			peer,
			codec: FrameCodec::new(),
		});
	}

	/// Reads from the client, feeds the codec, applies control events and
	/// forwards application data to the serial line.
	fn service_client(&mut self) {
		let Some(session) = self.session.as_mut() else {
			return;
		};

		let mut buf = [0u8; CLIENT_READ_CHUNK];
		let n = match session.stream.read(&mut buf) {
			Ok(0) => {
				self.log.event("Client disconnected").ok();
				self.session = None;
				return;
			}
			Ok(n) => n,
			Err(err)
				if err.kind() == io::ErrorKind::WouldBlock
					|| err.kind() == io::ErrorKind::Interrupted =>
			{
				return;
			}
			Err(_) => {
				self.log.event("Client connection reset").ok();
				self.session = None;
				return;
			}
		};

		let mut data = Vec::new();
		let events = session.codec.decode(&buf[..n], &mut data);

		// Replies for a subnegotiation go out once it is fully consumed,
		// before anything later in this read produces client traffic.
		let mut replies = Vec::new();
		for event in events {
			match event {
				Event::Reply(frame) => replies.extend_from_slice(&frame),
				Event::ComPort { subcmd, payload } => {
					if let Some(frame) =
						apply_com_port(&mut self.gate, &mut self.log, subcmd, &payload)
					{
						replies.extend_from_slice(&frame);
					}
				}
			}
		}
		if !replies.is_empty() {
			self.send_client(&replies);
		}

		if !data.is_empty() {
			match self.gate.write_all(&data) {
				Ok(()) => {
					self.log.data(Direction::Tx, &data).ok();
				}
				Err(err) => {
					warn!("serial write error: {err}");
					self.log.event(&format!("Serial write error: {err}")).ok();
				}
			}
		}
	}

	/// Drains the serial line and forwards to the client, best effort.
	fn service_serial(&mut self) {
		let mut buf = Vec::new();
		match self.gate.drain(&mut buf) {
			Ok(0) => return,
			Ok(_) => self.serial_error = None,
			Err(err) => {
				let text = err.to_string();
				if self.serial_error.as_deref() != Some(text.as_str()) {
					warn!("serial read error: {text}");
					self.log.event(&format!("Serial read error: {text}")).ok();
					self.serial_error = Some(text);
				}
				return;
			}
		}

		self.log.data(Direction::Rx, &buf).ok();
		self.send_client(&buf);
	}

	/// Single best-effort write. A kernel buffer full drops the tail; a
	/// hard error closes the session and the proxy keeps serving.
	fn send_client(&mut self, bytes: &[u8]) {
		let Some(session) = self.session.as_mut() else {
			return;
		};
		match session.stream.write(bytes) {
			Ok(_) => {}
			Err(err)
				if err.kind() == io::ErrorKind::WouldBlock
					|| err.kind() == io::ErrorKind::Interrupted => {}
			Err(err) => {
				debug!("client send to {} failed: {err}", session.peer);
				self.log.event("Client connection reset").ok();
				self.session = None;
			}
		}
	}
}

/// Applies one COM-Port-Option subnegotiation to the line and returns the
/// framed reply. Returns `None` when the payload is too short for the
/// subcommand or the line rejected the change; the byte streams stay
/// untouched either way.
pub fn apply_com_port<P: LinePort>(
	port: &mut P,
	log: &mut DeviceLog,
	subcmd: u8,
	payload: &[u8],
) -> Option<Vec<u8>> {
	let resp = subcmd.wrapping_add(RESPONSE_OFFSET);

	let too_short = |wanted: usize| {
		warn!(
			"malformed COM-Port subnegotiation {subcmd}: payload {} < {wanted}",
			payload.len()
		);
	};

	match subcmd {
		codec::SET_BAUDRATE => {
			if payload.len() < 4 {
				too_short(4);
				return None;
			}
			let request = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
			if request > 0 {
				if let Err(err) = port.set_baudrate(request) {
					log.event(&format!("Error handling COM-PORT option: {err}")).ok();
					return None;
				}
				log.event(&format!("Baudrate changed to {request}")).ok();
			}
			Some(encode_com_port(resp, &port.baudrate().to_be_bytes()))
		}
		codec::SET_DATASIZE => {
			let &[bits, ..] = payload else {
				too_short(1);
				return None;
			};
			if (5..=8).contains(&bits) {
				if let Err(err) = port.set_data_bits(bits) {
					log.event(&format!("Error handling COM-PORT option: {err}")).ok();
					return None;
				}
				log.event(&format!("Data size changed to {bits}")).ok();
			}
			Some(encode_com_port(resp, &[port.data_bits()]))
		}
		codec::SET_PARITY => {
			let &[code, ..] = payload else {
				too_short(1);
				return None;
			};
			let parity = Parity::from_rfc2217(code);
			if let Err(err) = port.set_parity(parity) {
				log.event(&format!("Error handling COM-PORT option: {err}")).ok();
				return None;
			}
			log.event(&format!("Parity changed to {parity}")).ok();
			Some(encode_com_port(resp, &[port.parity().to_rfc2217()]))
		}
		codec::SET_STOPSIZE => {
			let &[code, ..] = payload else {
				too_short(1);
				return None;
			};
			let stop_bits = StopBits::from_rfc2217(code);
			if let Err(err) = port.set_stop_bits(stop_bits) {
				log.event(&format!("Error handling COM-PORT option: {err}")).ok();
				return None;
			}
			log.event(&format!("Stop bits changed to {stop_bits}")).ok();
			Some(encode_com_port(resp, &[port.stop_bits().to_rfc2217()]))
		}
		codec::SET_CONTROL => {
			let &[control, ..] = payload else {
				too_short(1);
				return None;
			};
			let applied = match control {
				CONTROL_DTR_ON => port.set_dtr(true).map(|()| "DTR ON"),
				CONTROL_DTR_OFF => port.set_dtr(false).map(|()| "DTR OFF"),
				CONTROL_RTS_ON => port.set_rts(true).map(|()| "RTS ON"),
				CONTROL_RTS_OFF => port.set_rts(false).map(|()| "RTS OFF"),
				// Everything else is acknowledged without action.
				_ => Ok(""),
			};
			match applied {
				Ok("") => {}
				Ok(line) => {
					log.event(line).ok();
				}
				Err(err) => {
					log.event(&format!("Error handling COM-PORT option: {err}")).ok();
					return None;
				}
			}
			Some(encode_com_port(resp, &[control]))
		}
		// SET_LINESTATE_MASK, SET_MODEMSTATE_MASK and unknown subcommands
		// are acknowledged verbatim.
		_ => {
			let echoed: &[u8] = if payload.is_empty() { &[0] } else { payload };
			Some(encode_com_port(resp, echoed))
		}
	}
}
