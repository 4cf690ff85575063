//! Relay engine: full-duplex byte copy between two connections.
//!
//! Each direction is a [`pipe`] loop that reads from one connection and
//! writes to the other. A pipe closes only the connection it reads from;
//! the opposite-direction pipe closes the other one when *it* fails. Once
//! either side goes away, writes toward the closed side fail and both loops
//! wind down.

use crate::print::Printer;
use proxyprint_net::{Conn, is_ignorable_err};
use std::sync::Arc;

/// Copies bytes from `from` to `to` until either side fails, then closes
/// `from`.
///
/// Within one direction bytes are relayed in the order read, with no
/// reordering. Every successfully read chunk is handed to the printer before
/// being written; the handoff never blocks.
pub async fn pipe(from: &Conn, to: &Conn, buffer_size: usize, printer: &Printer) {
    let from_addr = from.peer_addr().to_string();
    let to_addr = to.peer_addr().to_string();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                if !is_ignorable_err(&err) {
                    tracing::warn!("[{from_addr}] relay read error: {err}");
                }
                break;
            }
        };
        printer.emit(&buf[..n], &from_addr, &to_addr);
        if let Err(err) = to.write_all(&buf[..n]).await {
            if !is_ignorable_err(&err) {
                tracing::warn!("[{from_addr}] relay write error: {err}");
            }
            break;
        }
    }
    from.close().await;
}

/// Runs both relay directions concurrently until either one terminates,
/// then closes both connections (idempotently; each pipe has already closed
/// the side it read from).
///
/// Tearing the pair down as soon as one direction ends is what keeps the
/// other direction from blocking forever on a peer that will never send
/// again; once either connection is gone the relay is over anyway, since a
/// closed connection rejects all further writes.
pub async fn run_pair(
    client: Arc<Conn>,
    server: Arc<Conn>,
    buffer_size: usize,
    client_printer: Printer,
    server_printer: Printer,
) {
    {
        let forward = pipe(&client, &server, buffer_size, &client_printer);
        let backward = pipe(&server, &client, buffer_size, &server_printer);
        tokio::select! {
            _ = forward => {}
            _ = backward => {}
        }
    }
    client.close().await;
    server.close().await;
}
