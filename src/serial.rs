//! Serial line adapter.
//!
//! [`SerialGate`] owns the tty and tracks the framing it has applied, so
//! protocol echoes always reflect the adapter's own state rather than
//! whatever the driver rounded the request to. [`LinePort`] is the control
//! seam the proxy session drives; tests substitute a mock.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::termios::{self, ControlFlags, SetArg};
use serialport::{DataBits, SerialPort, TTYPort};
use thiserror::Error;

/// Write budget for the tty. Reads never block: the proxy only reads
/// after readiness and drains `bytes_to_read()`.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_BAUDRATE: u32 = 115_200;

#[derive(Debug, Error)]
pub enum SerialError {
	#[error("failed to open {path}: {source}")]
	Open {
		path: PathBuf,
		source: serialport::Error,
	},
	#[error("failed to reconfigure serial line: {0}")]
	Configure(#[from] serialport::Error),
	#[error("invalid data size {0}, expected 5..=8")]
	InvalidDataBits(u8),
	#[error("termios: {0}")]
	Termios(#[from] nix::Error),
}

/// Parity, including the mark/space settings RFC 2217 can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	None,
	Odd,
	Even,
	Mark,
	Space,
}

impl Parity {
	/// Maps an RFC 2217 `SET_PARITY` payload byte. Unknown values fall
	/// back to no parity.
	pub fn from_rfc2217(code: u8) -> Self {
		match code {
			2 => Self::Odd,
			3 => Self::Even,
			4 => Self::Mark,
			5 => Self::Space,
			_ => Self::None,
		}
	}

	pub fn to_rfc2217(self) -> u8 {
		match self {
			Self::None => 1,
			Self::Odd => 2,
			Self::Even => 3,
			Self::Mark => 4,
			Self::Space => 5,
		}
	}
}

impl fmt::Display for Parity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::None => "N",
			Self::Odd => "O",
			Self::Even => "E",
			Self::Mark => "M",
			Self::Space => "S",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
	One,
	OnePointFive,
	Two,
}

impl StopBits {
	/// Maps an RFC 2217 `SET_STOPSIZE` payload byte. Unknown values fall
	/// back to one stop bit.
	pub fn from_rfc2217(code: u8) -> Self {
		match code {
			2 => Self::Two,
			3 => Self::OnePointFive,
			_ => Self::One,
		}
	}

	pub fn to_rfc2217(self) -> u8 {
		match self {
			Self::One => 1,
			Self::Two => 2,
			Self::OnePointFive => 3,
		}
	}
}

impl fmt::Display for StopBits {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::One => "1",
			Self::OnePointFive => "1.5",
			Self::Two => "2",
		};
		f.write_str(name)
	}
}

/// Line-control seam between the RFC 2217 session and the tty.
pub trait LinePort {
	fn baudrate(&self) -> u32;
	fn set_baudrate(&mut self, baudrate: u32) -> Result<(), SerialError>;

	fn data_bits(&self) -> u8;
	fn set_data_bits(&mut self, bits: u8) -> Result<(), SerialError>;

	fn parity(&self) -> Parity;
	fn set_parity(&mut self, parity: Parity) -> Result<(), SerialError>;

	fn stop_bits(&self) -> StopBits;
	fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), SerialError>;

	fn set_dtr(&mut self, level: bool) -> Result<(), SerialError>;
	fn set_rts(&mut self, level: bool) -> Result<(), SerialError>;
}

/// The tty behind one proxy.
pub struct SerialGate {
	port: TTYPort,
	path: PathBuf,
	baudrate: u32,
	data_bits: u8,
	parity: Parity,
	stop_bits: StopBits,
}

impl SerialGate {
	/// Opens and configures the device, 8N1 at the given baudrate.
	pub fn open(path: &Path, baudrate: u32) -> Result<Self, SerialError> {
		let port = serialport::new(path.to_string_lossy(), baudrate)
			.timeout(WRITE_TIMEOUT)
			.open_native()
			.map_err(|source| SerialError::Open {
				path: path.to_owned(),
				source,
			})?;

		Ok(Self {
			port,
			path: path.to_owned(),
			baudrate,
			data_bits: 8,
			parity: Parity::None,
			stop_bits: StopBits::One,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Bytes currently buffered by the driver.
	pub fn bytes_to_read(&self) -> u32 {
		self.port.bytes_to_read().unwrap_or(0)
	}

	/// Drains everything the driver has buffered into `buf`. Returns the
	/// number of bytes appended; `Ok(0)` when nothing was pending.
	pub fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
		let pending = self.bytes_to_read().max(1) as usize;
		let start = buf.len();
		buf.resize(start + pending, 0);

		match self.port.read(&mut buf[start..]) {
			Ok(n) => {
				buf.truncate(start + n);
				Ok(n)
			}
			Err(err)
				if err.kind() == io::ErrorKind::WouldBlock
					|| err.kind() == io::ErrorKind::TimedOut
					|| err.kind() == io::ErrorKind::Interrupted =>
			{
				buf.truncate(start);
				Ok(0)
			}
			Err(err) => {
				buf.truncate(start);
				Err(err)
			}
		}
	}

	pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
		self.port.write_all(bytes)
	}

	fn fd(&self) -> BorrowedFd<'_> {
		// The port owns the descriptor for the lifetime of the borrow.
		unsafe { BorrowedFd::borrow_raw(self.port.as_raw_fd()) }
	}

	/// Mark/space parity is not modeled by the serialport crate, so it is
	/// applied straight through termios.
	fn set_sticky_parity(&mut self, odd: bool) -> Result<(), SerialError> {
		let mut tios = termios::tcgetattr(self.fd())?;
		tios.control_flags
			.insert(ControlFlags::PARENB | ControlFlags::CMSPAR);
		tios.control_flags.set(ControlFlags::PARODD, odd);
		termios::tcsetattr(self.fd(), SetArg::TCSANOW, &tios)?;
		Ok(())
	}
}

impl AsRawFd for SerialGate {
	fn as_raw_fd(&self) -> RawFd {
		self.port.as_raw_fd()
	}
}

impl AsFd for SerialGate {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.fd()
	}
}

impl LinePort for SerialGate {
	fn baudrate(&self) -> u32 {
		self.baudrate
	}

	fn set_baudrate(&mut self, baudrate: u32) -> Result<(), SerialError> {
		self.port.set_baud_rate(baudrate)?;
		self.baudrate = baudrate;
		Ok(())
	}

	fn data_bits(&self) -> u8 {
		self.data_bits
	}

	fn set_data_bits(&mut self, bits: u8) -> Result<(), SerialError> {
		let mapped = match bits {
			5 => DataBits::Five,
			6 => DataBits::Six,
			7 => DataBits::Seven,
			8 => DataBits::Eight,
			other => return Err(SerialError::InvalidDataBits(other)),
		};
		self.port.set_data_bits(mapped)?;
		self.data_bits = bits;
		Ok(())
	}

	fn parity(&self) -> Parity {
		self.parity
	}

	fn set_parity(&mut self, parity: Parity) -> Result<(), SerialError> {
		match parity {
			Parity::None => self.port.set_parity(serialport::Parity::None)?,
			Parity::Odd => self.port.set_parity(serialport::Parity::Odd)?,
			Parity::Even => self.port.set_parity(serialport::Parity::Even)?,
			Parity::Mark => self.set_sticky_parity(true)?,
			Parity::Space => self.set_sticky_parity(false)?,
		}
		self.parity = parity;
		Ok(())
	}

	fn stop_bits(&self) -> StopBits {
		self.stop_bits
	}

	fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), SerialError> {
		// Linux termios has no 1.5-stop-bit setting; like pyserial, 1.5
		// drives the two-stop-bit flag while the adapter remembers the
		// requested framing for echoes.
		let mapped = match stop_bits {
			StopBits::One => serialport::StopBits::One,
			StopBits::OnePointFive | StopBits::Two => serialport::StopBits::Two,
		};
		self.port.set_stop_bits(mapped)?;
		self.stop_bits = stop_bits;
		Ok(())
	}

	fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
		self.port.write_data_terminal_ready(level)?;
		Ok(())
	}

	fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
		self.port.write_request_to_send(level)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parity_rfc2217_mapping() {
		assert_eq!(Parity::from_rfc2217(1), Parity::None);
		assert_eq!(Parity::from_rfc2217(2), Parity::Odd);
		assert_eq!(Parity::from_rfc2217(3), Parity::Even);
		assert_eq!(Parity::from_rfc2217(4), Parity::Mark);
		assert_eq!(Parity::from_rfc2217(5), Parity::Space);
		// Out-of-range requests degrade to no parity.
		assert_eq!(Parity::from_rfc2217(0), Parity::None);
		assert_eq!(Parity::from_rfc2217(77), Parity::None);

		for code in 1..=5 {
			assert_eq!(Parity::from_rfc2217(code).to_rfc2217(), code);
		}
	}

	#[test]
	fn stop_bits_rfc2217_mapping() {
		assert_eq!(StopBits::from_rfc2217(1), StopBits::One);
		assert_eq!(StopBits::from_rfc2217(2), StopBits::Two);
		assert_eq!(StopBits::from_rfc2217(3), StopBits::OnePointFive);
		assert_eq!(StopBits::from_rfc2217(9), StopBits::One);

		for code in 1..=3 {
			assert_eq!(StopBits::from_rfc2217(code).to_rfc2217(), code);
		}
	}
}
