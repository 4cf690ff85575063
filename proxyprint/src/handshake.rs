//! Tunnel handshake protocol.
//!
//! A tunneling agent dials the tunnel-accepting listener and the two sides
//! exchange a fixed binary preamble: tunnel header, version tag, password
//! (length-prefixed), and an OK/ERROR acknowledgement. Only after the
//! acceptor sends OK does the connection become a pairing candidate. The
//! readiness cross-check (`CLIENT_READY`/`SERVER_READY`) is a separate, final
//! liveness exchange performed immediately before a candidate is actually
//! used.

use proxyprint_net::wire;
use proxyprint_net::{Conn, is_ignorable_err};

/// Deadline applied to the whole acceptor-side handshake.
// TODO: make the handshake deadline a flag.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Window for the readiness cross-check on a dequeued candidate.
pub const READINESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("expected {expected:?} as tunnel bytes, got {got:?}")]
    BadHeader { expected: [u8; 4], got: [u8; 4] },
    /// Protocol skew is unrecoverable; on the agent side this is fatal to the
    /// whole tunneling loop, not just the attempt.
    #[error("can only handle version up to {supported}, got {got}")]
    VersionSkew { supported: u32, got: u32 },
    #[error("password length mismatch")]
    LengthMismatch,
    #[error("invalid password")]
    InvalidPassword,
    #[error("unexpected readiness bytes: {got:?}")]
    NotReady { got: [u8; 4] },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Expected connection noise that should be suppressed from the logs.
    pub fn is_ignorable(&self) -> bool {
        match self {
            HandshakeError::Io(err) => is_ignorable_err(err),
            _ => false,
        }
    }
}

/// Acceptor side of the handshake, run per connection accepted on the
/// tunnel-accepting listener.
///
/// On success the connection has been sent OK, its deadline is cleared, and
/// it is ready to enter the rendezvous registry. On failure the appropriate
/// ERROR response (if any) has been written but the connection is NOT closed;
/// the caller owns the close. Failures are per-connection and never fatal to
/// the listener.
pub async fn accept_tunnel(conn: &Conn, password: &[u8]) -> Result<(), HandshakeError> {
    conn.set_deadline(Some(tokio::time::Instant::now() + HANDSHAKE_TIMEOUT));

    // Inspect the magic without consuming, so a non-tunnel connection could
    // still be handed off with its bytes intact.
    let mut buf = [0u8; 4];
    let mut seen = 0;
    while seen < buf.len() {
        let n = conn.peek(&mut buf).await?;
        if n == seen {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        seen = n;
    }
    if buf != wire::TUNNEL_HDR {
        return Err(HandshakeError::BadHeader {
            expected: wire::TUNNEL_HDR,
            got: buf,
        });
    }
    conn.read_exact(&mut buf).await?;

    conn.write_all(&wire::VERSION).await?;

    // A mismatched length is sufficient rejection on its own; the password
    // bytes are never read.
    let mut len_buf = [0u8; 8];
    conn.read_exact(&mut len_buf).await?;
    if wire::decode_len(len_buf) != password.len() as u64 {
        let _ = conn.write_all(&wire::ERROR).await;
        return Err(HandshakeError::LengthMismatch);
    }

    match crate::password::check_against_stream(conn, password).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = conn.write_all(&wire::ERROR).await;
            return Err(HandshakeError::InvalidPassword);
        }
        Err(err) => {
            let _ = conn.write_all(&wire::ERROR).await;
            return Err(err.into());
        }
    }

    conn.write_all(&wire::OK).await?;
    conn.set_deadline(None);
    Ok(())
}

/// Agent side of the handshake, run per outbound dial attempt:
/// [`agent_auth`] followed by [`agent_await_pairing`].
pub async fn agent_handshake(conn: &Conn, password: &[u8]) -> Result<(), HandshakeError> {
    agent_auth(conn, password).await?;
    agent_await_pairing(conn).await
}

/// Authentication phase of the agent handshake: header, version, password,
/// OK/ERROR. Completes within one round trip and is meant to run under a
/// deadline, so a rejected password surfaces to the tunneler's retry policy
/// instead of a task waiting forever.
/// A [`HandshakeError::VersionSkew`] must stop the whole agent loop.
pub async fn agent_auth(conn: &Conn, password: &[u8]) -> Result<(), HandshakeError> {
    conn.write_all(&wire::TUNNEL_HDR).await?;

    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await?;
    let got = wire::version_of(buf);
    if got > wire::SUPPORTED_VERSION {
        return Err(HandshakeError::VersionSkew {
            supported: wire::SUPPORTED_VERSION,
            got,
        });
    }

    conn.write_all(&wire::encode_len(password.len() as u64)).await?;
    conn.write_all(password).await?;

    conn.read_exact(&mut buf).await?;
    if buf != wire::OK {
        return Err(HandshakeError::InvalidPassword);
    }
    Ok(())
}

/// Blocks until the far side pairs this tunnel with a client and probes
/// readiness; on return the connection is ready to be handed to the relay
/// pairing path as though it were a direct client.
pub async fn agent_await_pairing(conn: &Conn) -> Result<(), HandshakeError> {
    // No deadline here: the tunnel waits as long as it takes for a client to
    // show up at the remote end.
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await?;
    if buf != wire::CLIENT_READY {
        return Err(HandshakeError::NotReady { got: buf });
    }
    conn.write_all(&wire::SERVER_READY).await?;
    Ok(())
}

/// Final liveness check on a freshly dequeued tunnel candidate.
///
/// Returns whether the candidate answered the readiness probe; a failed
/// candidate is closed here (single owner for the close) and must not be
/// retried; the caller moves on to the next candidate.
pub async fn check_tunnel_readiness(conn: &Conn) -> bool {
    conn.set_deadline(Some(tokio::time::Instant::now() + READINESS_TIMEOUT));
    let ready = readiness_probe(conn).await;
    match ready {
        Ok(()) => {
            conn.set_deadline(None);
            true
        }
        Err(err) => {
            if !err.is_ignorable() {
                tracing::warn!("tunnel readiness check failed: {err}");
            }
            conn.close().await;
            false
        }
    }
}

async fn readiness_probe(conn: &Conn) -> Result<(), HandshakeError> {
    conn.write_all(&wire::CLIENT_READY).await?;
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await?;
    if buf != wire::SERVER_READY {
        return Err(HandshakeError::NotReady { got: buf });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn conn_pair() -> (Arc<Conn>, Arc<Conn>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::net::TcpStream::connect(addr);
        let (accepted, dialed) = tokio::join!(listener.accept(), dial);
        let (stream, _) = accepted.unwrap();
        (
            Arc::new(Conn::from_stream(stream).unwrap()),
            Arc::new(Conn::from_stream(dialed.unwrap()).unwrap()),
        )
    }

    #[tokio::test]
    async fn full_handshake_with_password() {
        let (acceptor, agent) = conn_pair().await;
        let accept = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { accept_tunnel(&acceptor, b"s3cret").await }
        });
        let agent_task = tokio::spawn({
            let agent = agent.clone();
            async move { agent_handshake(&agent, b"s3cret").await }
        });

        accept.await.unwrap().unwrap();
        // The agent now waits for the readiness probe.
        assert!(check_tunnel_readiness(&acceptor).await);
        agent_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_password_still_progresses() {
        let (acceptor, agent) = conn_pair().await;
        let accept = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { accept_tunnel(&acceptor, b"").await }
        });
        let agent_task = tokio::spawn({
            let agent = agent.clone();
            async move { agent_handshake(&agent, b"").await }
        });
        accept.await.unwrap().unwrap();
        assert!(check_tunnel_readiness(&acceptor).await);
        agent_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_same_length_gets_error() {
        let (acceptor, agent) = conn_pair().await;
        let accept = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { accept_tunnel(&acceptor, b"s3cret").await }
        });
        let res = agent_handshake(&agent, b"s3creX").await;
        assert!(matches!(res, Err(HandshakeError::InvalidPassword)));
        let res = accept.await.unwrap();
        assert!(matches!(res, Err(HandshakeError::InvalidPassword)));
    }

    #[tokio::test]
    async fn wrong_length_gets_error_without_password_bytes() {
        let (acceptor, agent) = conn_pair().await;
        let accept = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { accept_tunnel(&acceptor, b"s3cret").await }
        });

        // Drive the agent side by hand: send only the header and a bad
        // length, never any password bytes.
        agent.write_all(&wire::TUNNEL_HDR).await.unwrap();
        let mut buf = [0u8; 4];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, wire::VERSION);
        agent.write_all(&wire::encode_len(3)).await.unwrap();

        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, wire::ERROR);
        let res = accept.await.unwrap();
        assert!(matches!(res, Err(HandshakeError::LengthMismatch)));
    }

    #[tokio::test]
    async fn bad_header_is_rejected() {
        let (acceptor, agent) = conn_pair().await;
        agent.write_all(b"GET /").await.unwrap();
        let res = accept_tunnel(&acceptor, b"").await;
        assert!(matches!(res, Err(HandshakeError::BadHeader { .. })));
    }

    #[tokio::test]
    async fn version_skew_is_detected() {
        let (acceptor, agent) = conn_pair().await;
        let agent_task = tokio::spawn({
            let agent = agent.clone();
            async move { agent_handshake(&agent, b"").await }
        });
        // Pretend to be a future acceptor.
        let mut buf = [0u8; 4];
        acceptor.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, wire::TUNNEL_HDR);
        acceptor.write_all(&[0, 0, 0, 2]).await.unwrap();
        let res = agent_task.await.unwrap();
        assert!(matches!(
            res,
            Err(HandshakeError::VersionSkew { got: 2, .. })
        ));
    }

    #[tokio::test]
    async fn readiness_failure_closes_candidate() {
        let (acceptor, agent) = conn_pair().await;
        // The far side answers the probe with garbage.
        let far = tokio::spawn({
            let agent = agent.clone();
            async move {
                let mut buf = [0u8; 4];
                agent.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, wire::CLIENT_READY);
                agent.write_all(&[9, 9, 9, 9]).await.unwrap();
            }
        });
        assert!(!check_tunnel_readiness(&acceptor).await);
        assert!(acceptor.is_closed());
        far.await.unwrap();
    }
}
