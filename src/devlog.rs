//! Per-device traffic log.
//!
//! One append file per device and calendar day. Rotation is lazy: every
//! record first checks whether the local date rolled over, so no record is
//! ever written across a date boundary.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate};

/// USB metadata scraped from sysfs, used only to name log files.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
	pub product: Option<String>,
	pub serial: Option<String>,
	pub manufacturer: Option<String>,
}

impl DeviceInfo {
	/// Walks from `/sys/class/tty/<name>/device` up to the USB device
	/// carrying the descriptor attributes. Best effort; missing sysfs
	/// entries yield an empty result.
	pub fn probe(devnode: &Path) -> Self {
		let Some(tty_name) = devnode.file_name().and_then(|name| name.to_str()) else {
			return Self::default();
		};
		let sysfs = PathBuf::from(format!("/sys/class/tty/{tty_name}/device"));
		if !sysfs.exists() {
			return Self::default();
		}

		let mut dir = fs::canonicalize(&sysfs).unwrap_or(sysfs);
		for _ in 0..5 {
			let Some(parent) = dir.parent() else {
				break;
			};
			dir = parent.to_owned();
			if dir.join("product").exists() {
				break;
			}
		}

		let attr = |name: &str| -> Option<String> {
			let text = fs::read_to_string(dir.join(name)).ok()?;
			let text = text.trim();
			(!text.is_empty()).then(|| text.to_owned())
		};

		Self {
			product: attr("product"),
			serial: attr("serial"),
			manufacturer: attr("manufacturer"),
		}
	}
}

/// Derives the log-file stem for a device.
///
/// `<product>_<serial>` when both are known (product capped at 20 chars,
/// serial at 10), else whichever is present, else the sanitized tty
/// basename. An empty result falls back to `"serial"`.
pub fn device_name(devnode: &Path, info: &DeviceInfo) -> String {
	let product: String = info
		.product
		.as_deref()
		.unwrap_or("")
		.replace([' ', '/'], "_")
		.chars()
		.take(20)
		.collect();
	let serial: String = info
		.serial
		.as_deref()
		.unwrap_or("")
		.chars()
		.take(10)
		.collect();

	let name = if !product.is_empty() && !serial.is_empty() {
		format!("{product}_{serial}")
	} else if !product.is_empty() {
		product
	} else if !serial.is_empty() {
		serial
	} else {
		let base = devnode
			.file_name()
			.map(|name| name.to_string_lossy().replace('/', "_"))
			.unwrap_or_default();
		base.strip_prefix("dev_").unwrap_or(&base).to_owned()
	};

	if name.is_empty() {
		"serial".to_owned()
	} else {
		name
	}
}

/// Traffic direction of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Rx,
	Tx,
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Rx => "RX",
			Self::Tx => "TX",
		})
	}
}

/// Line-buffered append log with daily rotation.
pub struct DeviceLog {
	dir: PathBuf,
	device_name: String,
	file: Option<LineWriter<File>>,
	current_date: Option<NaiveDate>,
}

impl DeviceLog {
	pub fn create(dir: &Path, devnode: &Path, info: &DeviceInfo) -> io::Result<Self> {
		fs::create_dir_all(dir)?;
		let mut log = Self {
			dir: dir.to_owned(),
			device_name: device_name(devnode, info),
			file: None,
			current_date: None,
		};
		log.rotate(Local::now())?;
		Ok(log)
	}

	pub fn device_name(&self) -> &str {
		&self.device_name
	}

	/// Path of the file records currently go to.
	pub fn current_path(&self) -> Option<PathBuf> {
		let date = self.current_date?;
		Some(self.file_path(date))
	}

	fn file_path(&self, date: NaiveDate) -> PathBuf {
		self.dir
			.join(format!("{}_{}.log", self.device_name, date.format("%Y-%m-%d")))
	}

	/// Opens the file for the current date if it changed since the last
	/// record. The previous handle is closed without a trailer; the new
	/// file starts with an open marker.
	fn rotate(&mut self, now: DateTime<Local>) -> io::Result<()> {
		let today = now.date_naive();
		if self.current_date == Some(today) {
			return Ok(());
		}

		self.file = None;
		self.current_date = Some(today);
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(self.file_path(today))?;
		self.file = Some(LineWriter::new(file));
		let name = self.device_name.clone();
		self.write_record(now, "INFO", &format!("=== Log opened for {name} ==="))
	}

	fn write_record(&mut self, now: DateTime<Local>, tag: &str, text: &str) -> io::Result<()> {
		let Some(file) = self.file.as_mut() else {
			return Ok(());
		};
		let timestamp = now.format("%Y-%m-%d %H:%M:%S%.3f");
		writeln!(file, "[{timestamp}] [{tag}] {text}")
	}

	/// Appends an `[INFO]` event record.
	pub fn event(&mut self, text: &str) -> io::Result<()> {
		let now = Local::now();
		self.rotate(now)?;
		self.write_record(now, "INFO", text)
	}

	/// Appends traffic, decoded as UTF-8 with invalid sequences replaced
	/// and logged per line; control characters other than `\n\r\t` are
	/// rendered as `\xHH`. Only when nothing decodable survives at all
	/// does the payload collapse into a single hex record.
	pub fn data(&mut self, direction: Direction, bytes: &[u8]) -> io::Result<()> {
		if bytes.is_empty() {
			return Ok(());
		}
		let now = Local::now();
		self.rotate(now)?;
		let tag = direction.to_string();

		// A stray invalid byte must not turn readable traffic into a hex
		// dump; it becomes a replacement character inside the line.
		let text = String::from_utf8_lossy(bytes);
		let decoded_nothing = text.contains(char::REPLACEMENT_CHARACTER)
			&& text
				.chars()
				.all(|c| c == char::REPLACEMENT_CHARACTER || c.is_whitespace());
		if decoded_nothing {
			return self.write_record(now, &tag, &format!("HEX: {}", hex::encode(bytes)));
		}

		let printable = escape_control(&text);
		for line in printable.split('\n') {
			let line = line.trim_end();
			if !line.is_empty() {
				self.write_record(now, &tag, line)?;
			}
		}
		Ok(())
	}

	/// Writes the close marker and drops the handle.
	pub fn close(&mut self) -> io::Result<()> {
		if self.file.is_some() {
			self.event("=== Log closed ===")?;
		}
		if let Some(mut file) = self.file.take() {
			file.flush()?;
		}
		self.current_date = None;
		Ok(())
	}
}

impl Drop for DeviceLog {
	fn drop(&mut self) {
		self.close().ok();
	}
}

fn escape_control(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for c in text.chars() {
		if !c.is_control() || matches!(c, '\n' | '\r' | '\t') {
			out.push(c);
		} else {
			out.push_str(&format!("\\x{:02x}", c as u32));
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn name_prefers_product_and_serial() {
		let info = DeviceInfo {
			product: Some("CP2102 USB to UART Bridge Controller".to_owned()),
			serial: Some("0123456789abcdef".to_owned()),
			manufacturer: None,
		};
		assert_eq!(
			device_name(Path::new("/dev/ttyUSB0"), &info),
			"CP2102_USB_to_UART_B_0123456789"
		);
	}

	#[test]
	fn name_falls_back_to_single_attribute() {
		let product_only = DeviceInfo {
			product: Some("ESP32 DevKit".to_owned()),
			..Default::default()
		};
		assert_eq!(
			device_name(Path::new("/dev/ttyUSB0"), &product_only),
			"ESP32_DevKit"
		);

		let serial_only = DeviceInfo {
			serial: Some("A5069RR4".to_owned()),
			..Default::default()
		};
		assert_eq!(device_name(Path::new("/dev/ttyUSB0"), &serial_only), "A5069RR4");
	}

	#[test]
	fn name_sanitizes_tty_basename() {
		let info = DeviceInfo::default();
		assert_eq!(device_name(Path::new("/dev/ttyACM3"), &info), "ttyACM3");
		assert_eq!(device_name(Path::new("/dev/dev_tty"), &info), "tty");
	}

	#[test]
	fn empty_name_falls_back_to_serial() {
		let info = DeviceInfo::default();
		assert_eq!(device_name(Path::new("/dev/dev_"), &info), "serial");
	}

	#[test]
	fn escape_keeps_whitespace_and_escapes_control() {
		assert_eq!(escape_control("ab\r\n\tc"), "ab\r\n\tc");
		assert_eq!(escape_control("a\x1b[1mb"), "a\\x1b[1mb");
		assert_eq!(escape_control("\x00"), "\\x00");
	}
}
