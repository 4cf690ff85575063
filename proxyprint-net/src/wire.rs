//! Tunnel wire format.
//!
//! Every control message in the tunnel handshake is a fixed 4-byte magic
//! sequence; the only variable-length field is the password, which is
//! preceded by an 8-byte big-endian length. All integers on the wire are
//! big-endian.
//!
//! Handshake sequence (acceptor ← agent):
//!
//! ```text
//! agent    → TUNNEL_HDR
//! acceptor → VERSION
//! agent    → pwd len (8 bytes BE) + pwd bytes
//! acceptor → OK | ERROR
//! ```
//!
//! After OK, the readiness cross-check exchanges `CLIENT_READY` /
//! `SERVER_READY` immediately before the connection is paired with a client.

/// Sent by the tunneling agent before anything else.
pub const TUNNEL_HDR: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Protocol version tag sent by the acceptor in response to `TUNNEL_HDR`.
pub const VERSION: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Highest protocol version this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// Readiness probe sent by the side driving a candidate toward a pairing.
pub const CLIENT_READY: [u8; 4] = [0xfe, 0xfe, 0xfe, 0xfe];

/// Readiness answer sent back by the waiting tunnel side.
pub const SERVER_READY: [u8; 4] = [0xfd, 0xfd, 0xfd, 0xfd];

/// Password accepted.
pub const OK: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Password (or password length) rejected.
pub const ERROR: [u8; 4] = [0x00, 0x00, 0x00, 0x02];

/// Encodes a password length as it appears on the wire.
pub fn encode_len(len: u64) -> [u8; 8] {
    len.to_be_bytes()
}

/// Decodes an on-wire password length.
pub fn decode_len(buf: [u8; 8]) -> u64 {
    u64::from_be_bytes(buf)
}

/// Interprets a 4-byte version tag as an integer for ordering comparisons.
pub fn version_of(buf: [u8; 4]) -> u32 {
    u32::from_be_bytes(buf)
}

/// Whether an I/O error is expected, non-actionable connection noise.
///
/// End-of-stream, broken pipes, resets and deadline timeouts happen on every
/// ordinary disconnect; callers suppress these from the logs and just close
/// the connection. Anything else is logged, but a single connection's failure
/// is never fatal to the process.
pub fn is_ignorable_err(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_round_trip() {
        assert_eq!(encode_len(0), [0u8; 8]);
        assert_eq!(decode_len(encode_len(0)), 0);
        assert_eq!(decode_len(encode_len(1024)), 1024);
        assert_eq!(encode_len(1)[7], 1);
    }

    #[test]
    fn version_ordering() {
        assert_eq!(version_of(VERSION), SUPPORTED_VERSION);
        assert!(version_of([0, 0, 0, 2]) > SUPPORTED_VERSION);
    }

    #[test]
    fn ignorable_errors() {
        for kind in [
            std::io::ErrorKind::UnexpectedEof,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::TimedOut,
        ] {
            assert!(is_ignorable_err(&std::io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_ignorable_err(&std::io::Error::other("boom")));
    }
}
