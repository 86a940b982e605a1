//! Slot-based RFC 2217 serial portal.
//!
//! Exposes locally attached USB serial devices as RFC2217-compatible TCP
//! endpoints. A supervisor binds physical USB slots to fixed TCP ports, so
//! client connection strings survive replugs and device-node churn; one
//! proxy child per slot bridges the tty and a single TCP client, including
//! the COM-Port-Control subnegotiations (baud, framing, DTR/RTS) that
//! ESP32-family bootloader entry depends on.

#[macro_use]
extern crate log;

pub mod codec;
pub mod devlog;
pub mod http;
pub mod proxy;
pub mod serial;
pub mod slots;
pub mod supervisor;
