//! Network utilities for proxyprint
//!
//! This crate holds the pieces of proxyprint that sit directly on top of the
//! socket: the [`Conn`] wrapper (peek/unread-back buffering, deadlines,
//! exactly-once close) and the fixed tunnel wire format ([`wire`]).

mod conn;
pub mod wire;

pub use conn::Conn;
pub use wire::is_ignorable_err;
