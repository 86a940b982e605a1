//! Supervisor lifecycle tests with real proxy children on pty devices.

use std::fs::{self, File};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::signal::kill;
use nix::unistd::Pid;

use portal::slots::lock_file_name;
use portal::supervisor::{
	HotplugEvent, Settings, Supervisor, SupervisorError, Timing,
};

fn open_pty() -> (File, PathBuf) {
	let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK).unwrap();
	grantpt(&master).unwrap();
	unlockpt(&master).unwrap();
	let path = PathBuf::from(ptsname_r(&master).unwrap());
	let file = unsafe { File::from_raw_fd(master.into_raw_fd()) };
	(file, path)
}

fn free_port() -> u16 {
	TcpListener::bind(("127.0.0.1", 0))
		.unwrap()
		.local_addr()
		.unwrap()
		.port()
}

/// The built proxy binary, linked under a name the supervisor recognizes
/// as logging-capable so it receives the `-l` flag and logs into the
/// test's scratch directory.
fn proxy_exe(dir: &Path) -> PathBuf {
	let target = dir.join("serial_proxy");
	symlink(env!("CARGO_BIN_EXE_serial-proxy"), &target).unwrap();
	target
}

fn fast_timing() -> Timing {
	Timing {
		settle_timeout: Duration::from_millis(500),
		settle_poll: Duration::from_millis(50),
		spawn_grace: Duration::from_millis(300),
		listen_attempts: 20,
		listen_poll: Duration::from_millis(100),
		connect_timeout: Duration::from_millis(250),
		term_timeout: Duration::from_secs(5),
		kill_grace: Duration::from_millis(500),
	}
}

fn write_config(dir: &Path, slots: &[(&str, &str, u16)]) -> PathBuf {
	let entries: Vec<String> = slots
		.iter()
		.map(|(label, key, port)| {
			format!(r#"{{"label": "{label}", "slot_key": "{key}", "tcp_port": {port}}}"#)
		})
		.collect();
	let path = dir.join("slots.json");
	fs::write(&path, format!(r#"{{"slots": [{}]}}"#, entries.join(","))).unwrap();
	path
}

fn supervisor(dir: &Path, slots: &[(&str, &str, u16)], proxy_paths: Vec<PathBuf>) -> Supervisor {
	let config_file = write_config(dir, slots);
	Supervisor::new(Settings {
		config_file,
		lock_dir: dir.join("locks"),
		log_dir: dir.join("logs"),
		proxy_paths,
		timing: fast_timing(),
	})
	.unwrap()
}

fn pid_alive(pid: u32) -> bool {
	kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn unknown_slot_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let sup = supervisor(dir.path(), &[], vec![]);

	assert!(matches!(
		sup.start("nope", Path::new("/dev/ttyUSB0")),
		Err(SupervisorError::UnknownSlot)
	));
	assert!(matches!(
		sup.stop("nope"),
		Err(SupervisorError::UnknownSlot)
	));
}

#[test]
fn stop_is_idempotent_and_bumps_generation() {
	let dir = tempfile::tempdir().unwrap();
	let port = free_port();
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![]);

	let stopped = sup.stop("usb-1").unwrap();
	assert!(stopped.success);
	assert!(!stopped.running);

	let stopped = sup.stop("usb-1").unwrap();
	assert!(!stopped.running);

	let snapshot = sup.get_devices();
	assert_eq!(snapshot.slots[0].last_gen, 2);
	assert!(!snapshot.slots[0].running);
}

#[test]
fn start_on_missing_device_reports_not_ready() {
	// The settle check exhausts its budget, state stays stopped.
	let dir = tempfile::tempdir().unwrap();
	let port = free_port();
	let exe = proxy_exe(dir.path());
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![exe]);

	let err = sup
		.start("usb-1", Path::new("/dev/doesnotexist-portal-test"))
		.unwrap_err();
	assert!(matches!(err, SupervisorError::DeviceNotReady(_)));

	let snapshot = sup.get_devices();
	let slot = &snapshot.slots[0];
	assert!(!slot.running);
	assert_eq!(slot.last_gen, 1);
	assert!(slot.pid.is_none());
	assert!(slot
		.last_error
		.as_deref()
		.unwrap()
		.contains("not ready after settle timeout"));
}

#[test]
fn missing_executable_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();
	let sup = supervisor(
		dir.path(),
		&[("A", "usb-1", port)],
		vec![dir.path().join("not-installed")],
	);

	assert!(matches!(
		sup.start("usb-1", &pts),
		Err(SupervisorError::NoProxyExecutable)
	));
}

#[test]
fn early_child_exit_surfaces_the_code() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();
	let sup = supervisor(
		dir.path(),
		&[("A", "usb-1", port)],
		vec![PathBuf::from("/bin/false")],
	);

	match sup.start("usb-1", &pts).unwrap_err() {
		SupervisorError::ChildExitedEarly { code } => assert_eq!(code, Some(1)),
		other => panic!("unexpected error: {other}"),
	}
}

#[test]
fn silent_child_is_killed_and_reported() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();

	// Stays alive but never listens.
	let stub = dir.path().join("serial-proxy");
	fs::write(&stub, "#!/bin/sh\nexec sleep 30\n").unwrap();
	fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();

	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![stub]);
	assert!(matches!(
		sup.start("usb-1", &pts),
		Err(SupervisorError::PortNotListening)
	));
}

#[test]
fn lock_files_are_created_on_load() {
	let dir = tempfile::tempdir().unwrap();
	let port = free_port();
	let _sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![]);
	assert!(dir.path().join("locks").join(lock_file_name("usb-1")).exists());
}

#[test]
fn full_lifecycle_with_real_proxy() {
	let dir = tempfile::tempdir().unwrap();
	let (_master1, pts1) = open_pty();
	let port = free_port();
	let exe = proxy_exe(dir.path());
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![exe]);

	// First start spawns a child and waits for its port.
	let started = sup.start("usb-1", &pts1).unwrap();
	assert!(started.success);
	assert!(started.restarted);
	assert_eq!(started.port, port);
	let pid = started.pid.unwrap();
	assert!(pid_alive(pid));
	assert!(TcpStream::connect_timeout(
		&([127, 0, 0, 1], port).into(),
		Duration::from_secs(1)
	)
	.is_ok());

	let snapshot = sup.get_devices();
	let slot = &snapshot.slots[0];
	assert!(slot.running);
	assert_eq!(slot.last_gen, 1);
	assert_eq!(slot.pid, Some(pid));
	assert_eq!(slot.devnode.as_deref(), Some(pts1.to_str().unwrap()));
	assert_eq!(
		slot.url.as_deref(),
		Some(format!("rfc2217://{}:{port}", snapshot.host_ip).as_str())
	);

	// Idempotent re-start of a healthy child: no restart, new generation.
	let again = sup.start("usb-1", &pts1).unwrap();
	assert!(again.success);
	assert!(!again.restarted);
	assert_eq!(again.pid, Some(pid));
	assert_eq!(sup.get_devices().slots[0].last_gen, 2);

	// Stop returns only once the child is gone from the process table.
	let stopped = sup.stop("usb-1").unwrap();
	assert!(!stopped.running);
	assert!(!pid_alive(pid));

	let snapshot = sup.get_devices();
	let slot = &snapshot.slots[0];
	assert!(!slot.running);
	assert_eq!(slot.last_gen, 3);
	assert!(slot.devnode.is_none());
	assert!(slot.url.is_none());

	// Replug on a different devnode lands on the same TCP port.
	let (_master2, pts2) = open_pty();
	let replugged = sup.start("usb-1", &pts2).unwrap();
	assert!(replugged.restarted);
	assert_eq!(replugged.port, port);
	assert_ne!(replugged.pid, Some(pid));
	assert_eq!(sup.get_devices().slots[0].last_gen, 4);

	sup.stop("usb-1").unwrap();
}

#[test]
fn generations_increase_across_failed_and_successful_transitions() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();
	let exe = proxy_exe(dir.path());
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![exe]);

	let mut seen = Vec::new();
	sup.start("usb-1", Path::new("/dev/doesnotexist-portal-test"))
		.unwrap_err();
	seen.push(sup.get_devices().slots[0].last_gen);
	sup.stop("usb-1").unwrap();
	seen.push(sup.get_devices().slots[0].last_gen);
	sup.start("usb-1", &pts).unwrap();
	seen.push(sup.get_devices().slots[0].last_gen);
	sup.stop("usb-1").unwrap();
	seen.push(sup.get_devices().slots[0].last_gen);

	assert_eq!(seen, [1, 2, 3, 4]);
}

#[test]
fn hotplug_add_and_remove_dispatch() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();
	let exe = proxy_exe(dir.path());
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![exe]);

	let added = sup
		.hotplug("usb-1", HotplugEvent::Add { devnode: &pts })
		.unwrap();
	let value = serde_json::to_value(added).unwrap();
	assert_eq!(value["success"], true);
	assert_eq!(value["running"], true);
	assert_eq!(value["port"], port);

	let removed = sup.hotplug("usb-1", HotplugEvent::Remove).unwrap();
	let value = serde_json::to_value(removed).unwrap();
	assert_eq!(value["success"], true);
	assert_eq!(value["running"], false);

	assert!(matches!(
		sup.hotplug("missing", HotplugEvent::Remove),
		Err(SupervisorError::UnknownSlot)
	));
}

#[test]
fn dead_children_are_reaped_in_snapshots() {
	let dir = tempfile::tempdir().unwrap();
	let (_master, pts) = open_pty();
	let port = free_port();
	let exe = proxy_exe(dir.path());
	let sup = supervisor(dir.path(), &[("A", "usb-1", port)], vec![exe]);

	let started = sup.start("usb-1", &pts).unwrap();
	let pid = started.pid.unwrap();

	// Kill the child behind the supervisor's back. It stays a zombie
	// until the snapshot's reap collects it.
	kill(Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL).unwrap();
	std::thread::sleep(Duration::from_millis(300));

	let snapshot = sup.get_devices();
	let slot = &snapshot.slots[0];
	assert!(!slot.running);
	assert!(slot.pid.is_none());
	assert!(slot.devnode.is_none());
	assert_eq!(slot.last_error.as_deref(), Some("Process died"));
}
