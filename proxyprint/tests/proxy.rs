//! End-to-end tests driving whole proxy runtimes over localhost sockets.

use proxyprint::{Config, ProxyHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Spawns a TCP echo server and returns its address.
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

fn base_config() -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        ..Config::default()
    }
}

#[tokio::test]
async fn direct_proxy_echoes() {
    let echo = spawn_echo().await;
    let handle = ProxyHandle::start(Config {
        connect: echo.to_string(),
        ..base_config()
    })
    .await
    .unwrap();
    let addr = handle.client_addr().unwrap();

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello through the proxy").await.unwrap();
    let mut buf = [0u8; 23];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the proxy");

    drop(client);
    handle.shutdown().await;
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn tunneled_proxy_echoes() {
    let echo = spawn_echo().await;

    // The public side: accepts clients and tunnel offers.
    let public = ProxyHandle::start_with_password(
        Config {
            listen_servers: "127.0.0.1:0".to_string(),
            ..base_config()
        },
        b"s3cret".to_vec(),
    )
    .await
    .unwrap();

    // The agent side: dials tunnels to the public side and bridges them to
    // the backend.
    let agent = ProxyHandle::start_with_password(
        Config {
            tunnel: public.servers_addr().unwrap().to_string(),
            connect: echo.to_string(),
            ..Config::default()
        },
        b"s3cret".to_vec(),
    )
    .await
    .unwrap();

    let mut client = tokio::net::TcpStream::connect(public.client_addr().unwrap())
        .await
        .unwrap();
    client.write_all(b"ping over tunnel").await.unwrap();
    let mut buf = [0u8; 16];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping over tunnel");

    // A second client exercises tunnel replacement.
    let mut client2 = tokio::net::TcpStream::connect(public.client_addr().unwrap())
        .await
        .unwrap();
    client2.write_all(b"second").await.unwrap();
    let mut buf2 = [0u8; 6];
    client2.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"second");

    drop(client);
    drop(client2);
    public.shutdown().await;
    agent.shutdown().await;
    public.wait().await.unwrap();
    agent.wait().await.unwrap();
}

#[tokio::test]
async fn wrong_password_client_times_out() {
    let echo = spawn_echo().await;

    let public = ProxyHandle::start_with_password(
        Config {
            listen_servers: "127.0.0.1:0".to_string(),
            tunnel_wait_secs: 1,
            ..base_config()
        },
        b"right".to_vec(),
    )
    .await
    .unwrap();
    let agent = ProxyHandle::start_with_password(
        Config {
            tunnel: public.servers_addr().unwrap().to_string(),
            connect: echo.to_string(),
            ..Config::default()
        },
        b"wrong".to_vec(),
    )
    .await
    .unwrap();

    // No tunnel ever passes the handshake, so the client waits out the
    // pairing window and is turned away with a clean close.
    let mut client = tokio::net::TcpStream::connect(public.client_addr().unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    assert!(public.runtime().monitor().total_tunnel_wait_timeouts() >= 1);

    drop(client);
    public.shutdown().await;
    agent.shutdown().await;
    public.wait().await.unwrap();
    agent.wait().await.unwrap();
}

#[tokio::test]
async fn failed_auth_backs_off_between_attempts() {
    let echo = spawn_echo().await;

    let public = ProxyHandle::start_with_password(
        Config {
            listen_servers: "127.0.0.1:0".to_string(),
            ..base_config()
        },
        b"right".to_vec(),
    )
    .await
    .unwrap();
    let agent = ProxyHandle::start_with_password(
        Config {
            tunnel: public.servers_addr().unwrap().to_string(),
            connect: echo.to_string(),
            ..Config::default()
        },
        b"wrong".to_vec(),
    )
    .await
    .unwrap();

    // Every attempt is rejected at the password step; the retry delay must
    // keep the agent from hammering the remote with redials.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let attempts = agent.runtime().monitor().tunnel_connect_attempts();
    assert!(
        (1..=2).contains(&attempts),
        "{attempts} tunnel attempts in ~1.2s"
    );

    public.shutdown().await;
    agent.shutdown().await;
    public.wait().await.unwrap();
    agent.wait().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_relays() {
    let echo = spawn_echo().await;
    let handle = ProxyHandle::start(Config {
        connect: echo.to_string(),
        ..base_config()
    })
    .await
    .unwrap();
    let addr = handle.client_addr().unwrap();

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    handle.shutdown().await;
    let waited = tokio::spawn(handle.wait());
    // The open relay keeps the proxy alive.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!waited.is_finished());

    drop(client);
    waited.await.unwrap().unwrap();
}

#[tokio::test]
async fn monitor_endpoint_serves_counters() {
    let echo = spawn_echo().await;
    let handle = ProxyHandle::start(Config {
        connect: echo.to_string(),
        monitor_server: "127.0.0.1:0".to_string(),
        ..base_config()
    })
    .await
    .unwrap();

    let mut client = tokio::net::TcpStream::connect(handle.client_addr().unwrap())
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    let mut http = tokio::net::TcpStream::connect(handle.monitor_addr().unwrap())
        .await
        .unwrap();
    http.write_all(b"GET / HTTP/1.1\r\nHost: monitor\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    http.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"currentClients\":1"), "{response}");
    assert!(response.contains("\"totalTunnelAttempts\":0"), "{response}");

    drop(client);
    handle.shutdown().await;
    handle.wait().await.unwrap();
}
