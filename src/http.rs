//! HTTP facade.
//!
//! Three REST endpoints plus status, translated straight into supervisor
//! calls. CORS-permissive, JSON in and out. The facade stays thin: every
//! request is handled on a blocking worker, so slot transitions simply
//! queue behind the in-flight one.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;

use serde::Deserialize;
use serde_json::{json, Value};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::supervisor::{HotplugAction, HotplugEvent, Supervisor, SupervisorError};

pub const HTTP_PORT: u16 = 8080;

const WORKERS: usize = 4;

/// Cap on accepted request bodies; slot requests are tiny.
const MAX_BODY: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct StartRequest {
	slot_key: Option<String>,
	devnode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
	slot_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HotplugRequest {
	action: Option<String>,
	devnode: Option<String>,
	id_path: Option<String>,
}

/// Binds the API server and blocks, dispatching requests on a small pool
/// of workers.
pub fn serve(supervisor: Arc<Supervisor>, port: u16) -> io::Result<()> {
	let server = Arc::new(Server::http(("0.0.0.0", port)).map_err(io::Error::other)?);

	let mut workers = Vec::with_capacity(WORKERS);
	for worker in 0..WORKERS {
		let server = Arc::clone(&server);
		let supervisor = Arc::clone(&supervisor);
		workers.push(
			thread::Builder::new()
				.name(format!("http-{worker}"))
				.spawn(move || worker_loop(&server, &supervisor))?,
		);
	}
	for worker in workers {
		worker.join().ok();
	}
	Ok(())
}

fn worker_loop(server: &Server, supervisor: &Supervisor) {
	loop {
		match server.recv() {
			Ok(request) => handle(request, supervisor),
			Err(err) => {
				error!("http receive failed: {err}");
				return;
			}
		}
	}
}

fn handle(mut request: Request, supervisor: &Supervisor) {
	let method = request.method().clone();
	let url = request.url().to_owned();
	info!("{method} {url}");

	let (status, body) = match (&method, url.as_str()) {
		(Method::Options, _) => (200, Value::Null),
		(Method::Get, "/api/devices") => match serde_json::to_value(supervisor.get_devices()) {
			Ok(snapshot) => (200, snapshot),
			Err(err) => (500, json!({"error": err.to_string()})),
		},
		(Method::Get, "/api/info") => match serde_json::to_value(supervisor.info()) {
			Ok(info) => (200, info),
			Err(err) => (500, json!({"error": err.to_string()})),
		},
		(Method::Post, path) => match read_json(&mut request) {
			Some(body) => dispatch_post(supervisor, path, &body),
			None => (400, json!({"error": "Invalid JSON"})),
		},
		_ => (404, json!({"error": "Not found"})),
	};

	respond(request, &method, status, &body);
}

fn dispatch_post(supervisor: &Supervisor, path: &str, body: &Value) -> (u16, Value) {
	match path {
		"/api/start" => {
			let Ok(StartRequest {
				slot_key: Some(slot_key),
				devnode: Some(devnode),
			}) = StartRequest::deserialize(body)
			else {
				return (400, json!({"error": "Missing slot_key or devnode"}));
			};
			match supervisor.start(&slot_key, devnode.as_ref()) {
				Ok(ok) => (200, serde_json::to_value(ok).unwrap_or_default()),
				Err(err) => (400, error_body(&err, &slot_key)),
			}
		}
		"/api/stop" => {
			let Ok(StopRequest {
				slot_key: Some(slot_key),
			}) = StopRequest::deserialize(body)
			else {
				return (400, json!({"error": "Missing slot_key"}));
			};
			match supervisor.stop(&slot_key) {
				Ok(ok) => (200, serde_json::to_value(ok).unwrap_or_default()),
				Err(err) => (400, error_body(&err, &slot_key)),
			}
		}
		"/api/hotplug" => {
			let Ok(HotplugRequest {
				action: Some(action),
				devnode,
				id_path: Some(slot_key),
			}) = HotplugRequest::deserialize(body)
			else {
				return (400, json!({"error": "Missing action or id_path"}));
			};

			let action: HotplugAction = match action.parse() {
				Ok(action) => action,
				Err(err) => return (400, json!({"error": err.to_string()})),
			};
			let event = match (action, devnode.as_deref()) {
				(HotplugAction::Add, Some(devnode)) => HotplugEvent::Add {
					devnode: devnode.as_ref(),
				},
				(HotplugAction::Add, None) => {
					return (400, json!({"error": "Missing devnode for add"}));
				}
				(HotplugAction::Remove, _) => HotplugEvent::Remove,
			};

			// Hotplug always answers 200; udev callers only care about
			// the envelope.
			match supervisor.hotplug(&slot_key, event) {
				Ok(ok) => (200, serde_json::to_value(ok).unwrap_or_default()),
				Err(err) => (200, error_body(&err, &slot_key)),
			}
		}
		_ => (404, json!({"error": "Not found"})),
	}
}

fn error_body(err: &SupervisorError, slot_key: &str) -> Value {
	let mut body = json!({"success": false, "error": err.to_string()});
	if matches!(err, SupervisorError::UnknownSlot) {
		body["slot_key"] = json!(slot_key);
	}
	body
}

/// An empty body parses as `{}`, mirroring the original portal.
fn read_json(request: &mut Request) -> Option<Value> {
	let mut text = String::new();
	request
		.as_reader()
		.take(MAX_BODY as u64)
		.read_to_string(&mut text)
		.ok()?;
	if text.is_empty() {
		return Some(json!({}));
	}
	serde_json::from_str(&text).ok()
}

fn header(name: &str, value: &str) -> Header {
	Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

fn respond(request: Request, method: &Method, status: u16, body: &Value) {
	let text = if body.is_null() {
		String::new()
	} else {
		serde_json::to_string_pretty(body).unwrap_or_default()
	};

	let mut response = Response::from_string(text)
		.with_status_code(status)
		.with_header(header("Content-Type", "application/json"))
		.with_header(header("Access-Control-Allow-Origin", "*"));
	if *method == Method::Options {
		response = response
			.with_header(header("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
			.with_header(header("Access-Control-Allow-Headers", "Content-Type"));
	}

	if let Err(err) = request.respond(response) {
		debug!("failed to send response: {err}");
	}
}
