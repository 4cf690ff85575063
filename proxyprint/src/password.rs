//! Tunnel admission password.
//!
//! The password is resolved once at startup and never mutated afterwards. An
//! empty password is valid and means tunnel admission is open (documented
//! relaxed-security behavior, not a bug).

use proxyprint_net::Conn;

/// Cap on a single comparison chunk; the full password never needs to sit in
/// one contiguous compared buffer.
const CHECK_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password environment variable {0} doesn't exist")]
    EnvMissing(String),
    #[error("error reading password from {path} (gotten from env var {env}): {source}")]
    FileRead {
        path: String,
        env: String,
        source: std::io::Error,
    },
}

/// Resolves the configured password source.
///
/// An empty source name resolves to an empty password. A name with a `file:`
/// prefix names an environment variable whose value is a file path; the file
/// contents become the password verbatim (no trimming). Any other name is
/// looked up directly as an environment variable. A missing variable is a
/// warning unless `required` is set, in which case startup fails.
pub fn resolve(env_name: &str, required: bool) -> Result<Vec<u8>, PasswordError> {
    if env_name.is_empty() {
        return Ok(Vec::new());
    }
    let (name, read_file) = match env_name.strip_prefix("file:") {
        Some(rest) => (rest, true),
        None => (env_name, false),
    };
    let val = match std::env::var(name) {
        Ok(val) => val,
        Err(_) => {
            if required {
                return Err(PasswordError::EnvMissing(name.to_string()));
            }
            tracing::warn!("password environment variable {name} doesn't exist");
            return Ok(Vec::new());
        }
    };
    if !read_file {
        return Ok(val.into_bytes());
    }
    std::fs::read(&val).map_err(|source| PasswordError::FileRead {
        path: val,
        env: name.to_string(),
        source,
    })
}

/// Reads `expected.len()` bytes from `conn` in bounded chunks and compares
/// byte-for-byte against `expected`.
///
/// Returns `Ok(true)` immediately when `expected` is empty (zero bytes
/// consumed), `Ok(false)` on the first mismatch, and propagates I/O errors.
/// The comparison early-exits on mismatch and is deliberately not
/// timing-safe; the handshake deadline on `conn` bounds how long this can
/// block.
pub async fn check_against_stream(conn: &Conn, expected: &[u8]) -> std::io::Result<bool> {
    if expected.is_empty() {
        return Ok(true);
    }
    let mut buf = vec![0u8; expected.len().min(CHECK_CHUNK)];
    let mut rest = expected;
    while !rest.is_empty() {
        let want = rest.len().min(buf.len());
        let n = conn.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if buf[..n] != rest[..n] {
            return Ok(false);
        }
        rest = &rest[n..];
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn conn_with(data: Vec<u8>) -> Conn {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&data).await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        writer.await.unwrap();
        Conn::from_stream(stream).unwrap()
    }

    #[tokio::test]
    async fn exact_password_passes() {
        let conn = conn_with(b"s3cret".to_vec()).await;
        assert!(check_against_stream(&conn, b"s3cret").await.unwrap());
    }

    #[tokio::test]
    async fn single_byte_mutations_fail() {
        let expected = b"s3cret";
        for i in 0..expected.len() {
            let mut sent = expected.to_vec();
            sent[i] ^= 0x01;
            let conn = conn_with(sent).await;
            assert!(
                !check_against_stream(&conn, expected).await.unwrap(),
                "mutation at byte {i} passed"
            );
        }
    }

    #[tokio::test]
    async fn empty_password_consumes_nothing() {
        let conn = conn_with(b"whatever".to_vec()).await;
        assert!(check_against_stream(&conn, b"").await.unwrap());
        // The stream content is untouched.
        let mut buf = [0u8; 8];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"whatever");
    }

    #[tokio::test]
    async fn large_password_compares_in_chunks() {
        let pwd: Vec<u8> = (0..5000u32).map(|n| (n % 251) as u8).collect();
        let conn = conn_with(pwd.clone()).await;
        assert!(check_against_stream(&conn, &pwd).await.unwrap());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let conn = conn_with(b"s3c".to_vec()).await;
        let err = check_against_stream(&conn, b"s3cret").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn resolve_empty_name_is_empty_password() {
        assert!(resolve("", true).unwrap().is_empty());
    }

    #[test]
    fn resolve_from_env_var() {
        // Unique name to avoid clashing with other tests in this process.
        unsafe { std::env::set_var("PROXYPRINT_TEST_PWD_DIRECT", "hunter2") };
        assert_eq!(
            resolve("PROXYPRINT_TEST_PWD_DIRECT", true).unwrap(),
            b"hunter2"
        );
    }

    #[test]
    fn resolve_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from-file\n").unwrap();
        unsafe { std::env::set_var("PROXYPRINT_TEST_PWD_FILE", file.path()) };
        // Contents are the password verbatim, trailing newline included.
        assert_eq!(
            resolve("file:PROXYPRINT_TEST_PWD_FILE", true).unwrap(),
            b"from-file\n"
        );
    }

    #[test]
    fn resolve_missing_env() {
        assert!(resolve("PROXYPRINT_TEST_PWD_ABSENT", true).is_err());
        assert!(resolve("PROXYPRINT_TEST_PWD_ABSENT", false)
            .unwrap()
            .is_empty());
    }
}
