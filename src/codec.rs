//! Telnet framing and RFC 2217 COM-Port-Option subnegotiation.
//!
//! The codec splits an incoming byte stream into application data destined
//! for the serial line and control events for the session. Parser state
//! survives across reads, so frames split at arbitrary byte offsets resume
//! on the next [`FrameCodec::decode`] call.

use std::mem;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

/// Telnet option 44, RFC 2217.
pub const COM_PORT_OPTION: u8 = 44;

pub const SET_BAUDRATE: u8 = 1;
pub const SET_DATASIZE: u8 = 2;
pub const SET_PARITY: u8 = 3;
pub const SET_STOPSIZE: u8 = 4;
pub const SET_CONTROL: u8 = 5;
pub const SET_LINESTATE_MASK: u8 = 10;
pub const SET_MODEMSTATE_MASK: u8 = 11;

/// Server replies carry the client subcommand shifted by this offset.
pub const RESPONSE_OFFSET: u8 = 100;

/// `SET_CONTROL` payload values for DTR/RTS line control.
pub const CONTROL_DTR_ON: u8 = 8;
pub const CONTROL_DTR_OFF: u8 = 9;
pub const CONTROL_RTS_ON: u8 = 11;
pub const CONTROL_RTS_OFF: u8 = 12;

/// Control output of one decode pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	/// Raw Telnet negotiation reply to be written back to the client.
	Reply(Vec<u8>),
	/// A complete COM-Port-Option subnegotiation.
	ComPort { subcmd: u8, payload: Vec<u8> },
}

#[derive(Debug)]
enum State {
	/// Plain application data.
	Data,
	/// Consumed an `IAC`.
	Iac,
	/// Consumed `IAC <DO|DONT|WILL|WONT>`, waiting for the option byte.
	Negotiate(u8),
	/// Consumed `IAC SB`, waiting for the option byte.
	Subneg,
	/// Inside a COM-Port subnegotiation, collecting subcommand and payload.
	ComPort(Vec<u8>),
	/// Inside a COM-Port subnegotiation, consumed an `IAC`.
	ComPortIac(Vec<u8>),
	/// Inside a foreign subnegotiation, discarding up to `IAC SE`.
	Skip,
	/// Inside a foreign subnegotiation, consumed an `IAC`.
	SkipIac,
}

/// Incremental Telnet / COM-Port-Option parser.
#[derive(Debug)]
pub struct FrameCodec {
	state: State,
}

impl Default for FrameCodec {
	fn default() -> Self {
		Self::new()
	}
}

impl FrameCodec {
	pub fn new() -> Self {
		Self { state: State::Data }
	}

	/// Consumes `input`, appending application bytes to `data` and
	/// returning the control events completed by this read.
	///
	/// No input byte is ever attributed to both streams: everything
	/// between `IAC SB` and the matching `IAC SE` stays out of `data`,
	/// and `IAC IAC` contributes exactly one `0xFF` data byte.
	pub fn decode(&mut self, input: &[u8], data: &mut Vec<u8>) -> Vec<Event> {
		let mut events = Vec::new();

		for &byte in input {
			self.state = match mem::replace(&mut self.state, State::Data) {
				State::Data => {
					if byte == IAC {
						State::Iac
					} else {
						data.push(byte);
						State::Data
					}
				}
				State::Iac => Self::dispatch_command(byte, data),
				State::Negotiate(cmd) => {
					match (cmd, byte) {
						(DO, COM_PORT_OPTION) => {
							events.push(Event::Reply(vec![IAC, WILL, COM_PORT_OPTION]));
						}
						(WILL, COM_PORT_OPTION) => {
							events.push(Event::Reply(vec![IAC, DO, COM_PORT_OPTION]));
						}
						// All other options are ignored silently.
						_ => {}
					}
					State::Data
				}
				State::Subneg => {
					if byte == COM_PORT_OPTION {
						State::ComPort(Vec::new())
					} else {
						State::Skip
					}
				}
				State::ComPort(mut buf) => {
					if byte == IAC {
						State::ComPortIac(buf)
					} else {
						buf.push(byte);
						State::ComPort(buf)
					}
				}
				State::ComPortIac(mut buf) => match byte {
					SE => {
						if let Some((&subcmd, payload)) = buf.split_first() {
							events.push(Event::ComPort {
								subcmd,
								payload: payload.to_vec(),
							});
						} else {
							debug!("dropping empty COM-Port subnegotiation");
						}
						State::Data
					}
					// Escape-doubled 0xFF inside the payload.
					IAC => {
						buf.push(IAC);
						State::ComPort(buf)
					}
					other => {
						warn!(
							"unterminated COM-Port subnegotiation, dropping {} bytes",
							buf.len()
						);
						Self::dispatch_command(other, data)
					}
				},
				State::Skip => {
					if byte == IAC {
						State::SkipIac
					} else {
						State::Skip
					}
				}
				State::SkipIac => {
					if byte == SE {
						State::Data
					} else {
						State::Skip
					}
				}
			};
		}

		events
	}

	/// Handles the byte following a lone `IAC`.
	fn dispatch_command(byte: u8, data: &mut Vec<u8>) -> State {
		match byte {
			IAC => {
				data.push(IAC);
				State::Data
			}
			SB => State::Subneg,
			DO | DONT | WILL | WONT => State::Negotiate(byte),
			other => {
				debug!("ignoring telnet command {other}");
				State::Data
			}
		}
	}
}

/// Frames a COM-Port-Option subnegotiation, escape-doubling any `0xFF`
/// inside the payload.
pub fn encode_com_port(cmd: u8, payload: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(payload.len() + 6);
	frame.extend_from_slice(&[IAC, SB, COM_PORT_OPTION, cmd]);
	for &byte in payload {
		if byte == IAC {
			frame.push(IAC);
		}
		frame.push(byte);
	}
	frame.extend_from_slice(&[IAC, SE]);
	frame
}
