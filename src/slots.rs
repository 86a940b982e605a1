//! Slot registry.
//!
//! Slots are loaded once from the configuration document and immutable
//! afterwards; only the per-slot [`SlotState`] behind each mutex changes.
//! Nothing is persisted: a portal restart forgets generations, errors and
//! running children.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::fcntl::{Flock, FlockArg};
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const CONFIG_ENV: &str = "RFC2217_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/rfc2217/slots.json";
pub const DEFAULT_LOCK_DIR: &str = "/run/rfc2217/locks";
pub const DEFAULT_LOG_DIR: &str = "/var/log/serial";

/// One entry of the `slots` array in the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
	pub label: String,
	pub slot_key: String,
	pub tcp_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDoc {
	#[serde(default)]
	slots: Vec<serde_json::Value>,
}

/// Mutable slot state. Every field mutation happens under the slot mutex.
#[derive(Debug, Default)]
pub struct SlotState {
	pub running: bool,
	pub pid: Option<u32>,
	pub child: Option<Child>,
	pub devnode: Option<PathBuf>,
	pub last_gen: u64,
	pub last_error: Option<String>,
}

/// A configured slot: the static binding plus its serialized state.
pub struct Slot {
	pub label: String,
	pub slot_key: String,
	pub tcp_port: u16,
	state: Mutex<SlotState>,
	/// Advisory lock held for the portal's lifetime, see [`lock_file_name`].
	_lock: Option<Flock<File>>,
}

impl Slot {
	/// All transitions for this slot queue behind this guard.
	pub fn lock(&self) -> MutexGuard<'_, SlotState> {
		self.state
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}

/// `sha256(slot_key)[:16] + ".lock"`
pub fn lock_file_name(slot_key: &str) -> String {
	let digest = Sha256::digest(slot_key.as_bytes());
	format!("{}.lock", &hex::encode(digest)[..16])
}

fn acquire_lock(lock_dir: &Path, slot_key: &str) -> Option<Flock<File>> {
	let path = lock_dir.join(lock_file_name(slot_key));
	let file = match OpenOptions::new().create(true).write(true).open(&path) {
		Ok(file) => file,
		Err(err) => {
			warn!("cannot create lock file {}: {err}", path.display());
			return None;
		}
	};
	match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
		Ok(lock) => Some(lock),
		Err((_, errno)) => {
			warn!(
				"slot lock {} is held by another process: {errno}",
				path.display()
			);
			None
		}
	}
}

/// All configured slots, keyed by `slot_key`, in configuration order.
#[derive(Default)]
pub struct SlotStore {
	slots: Vec<Arc<Slot>>,
	by_key: HashMap<String, Arc<Slot>>,
}

impl SlotStore {
	/// Loads the configuration document. A missing file yields an empty
	/// store; malformed entries are skipped so the rest still load.
	pub fn load(config_file: &Path, lock_dir: &Path) -> Self {
		let mut store = Self::default();

		let text = match fs::read_to_string(config_file) {
			Ok(text) => text,
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				warn!("config file not found: {}", config_file.display());
				return store;
			}
			Err(err) => {
				error!("error reading config {}: {err}", config_file.display());
				return store;
			}
		};

		let doc: ConfigDoc = match serde_json::from_str(&text) {
			Ok(doc) => doc,
			Err(err) => {
				error!("error loading config: {err}");
				return store;
			}
		};

		for value in doc.slots {
			let config: SlotConfig = match serde_json::from_value(value) {
				Ok(config) => config,
				Err(err) => {
					error!("skipping malformed slot entry: {err}");
					continue;
				}
			};
			store.insert(config, lock_dir);
		}

		info!(
			"loaded {} slots from {}",
			store.slots.len(),
			config_file.display()
		);
		store
	}

	fn insert(&mut self, config: SlotConfig, lock_dir: &Path) {
		if self.by_key.contains_key(&config.slot_key) {
			error!("skipping duplicate slot_key {}", config.slot_key);
			return;
		}
		// TCP ports are partitioned by configuration; a duplicate would
		// let two children contend for one port.
		if self.slots.iter().any(|slot| slot.tcp_port == config.tcp_port) {
			error!(
				"skipping slot {}: tcp_port {} already in use",
				config.label, config.tcp_port
			);
			return;
		}

		let slot = Arc::new(Slot {
			_lock: acquire_lock(lock_dir, &config.slot_key),
			label: config.label,
			slot_key: config.slot_key,
			tcp_port: config.tcp_port,
			state: Mutex::new(SlotState::default()),
		});
		self.by_key.insert(slot.slot_key.clone(), Arc::clone(&slot));
		self.slots.push(slot);
	}

	pub fn get(&self, slot_key: &str) -> Option<&Arc<Slot>> {
		self.by_key.get(slot_key)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Slot>> {
		self.slots.iter()
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}
}
