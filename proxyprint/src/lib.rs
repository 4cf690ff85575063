//! # proxyprint
//!
//! A tunneling TCP proxy that can print relayed traffic in a variety of ways.
//!
//! The proxy accepts clients on a public listener and forwards their bytes to
//! a backend, either by dialing the backend directly (`connect`) or by
//! pairing each client with an authenticated tunnel connection offered by a
//! remote tunneling agent (`listen-servers` / `tunnel`). Relayed payloads can
//! be rendered to a print sink per direction (as text, byte literals, or hex).
//!
//! The pieces:
//!
//! - [`config`]: the configuration surface (CLI flags merged over an optional
//!   JSON config file).
//! - [`password`]: tunnel admission password, resolved from the environment
//!   and compared against the handshake stream in bounded chunks.
//! - [`handshake`]: the fixed binary preamble exchanged between a tunneling
//!   agent and the tunnel-accepting listener.
//! - [`registry`]: bounded rendezvous queue of authenticated tunnel
//!   candidates awaiting a client pairing.
//! - [`relay`]: full-duplex byte copy between two connections.
//! - [`print`]: payload rendering and the bounded print-sink task.
//! - [`monitor`]: process-wide counters, in-flight work tracking, and the
//!   HTTP monitor endpoint.
//! - [`runtime`]: [`runtime::ProxyRuntime`], the context object that wires
//!   everything together and drives graceful shutdown.

pub mod config;
pub mod handshake;
pub mod monitor;
pub mod password;
pub mod print;
pub mod registry;
pub mod relay;
pub mod runtime;

pub use config::{Config, ConfigError};
pub use monitor::{ConnectionTracker, Monitor};
pub use print::{PrintSink, PrintStatus};
pub use runtime::{ProxyHandle, ProxyRuntime, RuntimeError};
