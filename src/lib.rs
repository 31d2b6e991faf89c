//! editor-bridge library
//!
//! Transport layer that lets an external controller drive a single-threaded
//! host application by sending named commands and receiving JSON results:
//! - Length-prefixed framing over a loopback TCP listener
//! - WebSocket client to a command hub with registration and reconnection
//! - Command queue drained on the host's cooperative thread
//! - Status file so controllers can discover the live port

pub mod config;
pub mod dispatcher;
pub mod heartbeat;
pub mod host;
pub mod ports;
pub mod registry;
pub(crate) mod sync;
pub mod transport;
