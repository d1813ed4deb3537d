//! gaovm: a two-process local virtual-machine manager.
//!
//! A control-plane daemon (`gaovmd`) owns desired state and supervises one
//! short-lived runtime-driver child (`gaovm-driver`) per VM; clients (the
//! `gaovm` tool, UIs) talk to the daemon over a local stream socket using
//! length-prefixed JSON-RPC. This crate is the fabric between those
//! processes: framing, the bidirectional channel and handshake, the driver
//! supervisor with bounded-backoff restarts, atomic config/state
//! persistence, and the daemon's session dispatch.

pub mod channel;
pub mod client;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod events;
pub mod handshake;
pub mod logsink;
pub mod persist;
pub mod proto;
pub mod supervisor;
pub mod util;

pub use error::Error;
