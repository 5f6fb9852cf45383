mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{read_response, read_until_close};
use h1loop::app::HelloApp;
use h1loop::server::ServerAddress;
use h1loop::{Application, HttpContext, Server, ServerOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;

fn test_options() -> ServerOptions {
    ServerOptions {
        addresses: vec!["127.0.0.1:0".to_string()],
        thread_count: 2,
        shutdown_timeout_secs: 2,
        ..ServerOptions::default()
    }
}

#[tokio::test]
async fn test_server_keep_alive_over_tcp() {
    let server = Server::start(&test_options(), Arc::new(HelloApp)).unwrap();
    let addr = server.local_addr().unwrap();
    assert_ne!(addr.port(), 0);

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    for i in 0..5 {
        let body = format!("message {i}");
        let request = format!(
            "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        write.write_all(request.as_bytes()).await.unwrap();
        let response = read_response(&mut reader, false).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, body.as_bytes());
    }
    assert_eq!(server.connection_count(), 1);

    drop(write);
    assert!(read_until_close(&mut reader).await.is_empty());
    assert!(server.shutdown().await);
}

#[tokio::test]
async fn test_server_spreads_connections_over_loops() {
    let server = Server::start(&test_options(), Arc::new(HelloApp)).unwrap();
    let addr = server.local_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        assert_eq!(read_response(&mut reader, false).await.status, 200);
        clients.push((reader, write));
    }
    assert_eq!(server.connection_count(), 4);

    // Idle keep-alive connections are closed by a graceful stop.
    assert!(server.shutdown().await);
    for (mut reader, _write) in clients {
        assert!(read_until_close(&mut reader).await.is_empty());
    }
}

struct SlowApp {
    started: Arc<Notify>,
}

#[async_trait(?Send)]
impl Application for SlowApp {
    async fn process_request(&self, ctx: &mut HttpContext) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.set_header("Content-Length", "4")?;
        ctx.write(b"done").await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_request_finish() {
    let started = Arc::new(Notify::new());
    let server = Server::start(
        &test_options(),
        Arc::new(SlowApp {
            started: started.clone(),
        }),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
    started.notified().await;

    let (graceful, raw) = tokio::join!(server.shutdown(), read_until_close(&mut stream));
    assert!(graceful);
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("Connection: close\r\n"));
    assert!(raw.ends_with("\r\n\r\ndone"));
}

struct StuckApp {
    started: Arc<Notify>,
}

#[async_trait(?Send)]
impl Application for StuckApp {
    async fn process_request(&self, _ctx: &mut HttpContext) -> anyhow::Result<()> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_aborts_after_timeout() {
    let started = Arc::new(Notify::new());
    let options = ServerOptions {
        shutdown_timeout_secs: 0,
        ..test_options()
    };
    let server = Server::start(
        &options,
        Arc::new(StuckApp {
            started: started.clone(),
        }),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
    started.notified().await;

    assert!(!server.shutdown().await);
    assert!(read_until_close(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_server_listens_on_unix_socket() {
    let path = std::env::temp_dir().join(format!("h1loop-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let options = ServerOptions {
        addresses: vec![format!("unix:{}", path.display())],
        ..test_options()
    };
    let server = Server::start(&options, Arc::new(HelloApp)).unwrap();
    assert_eq!(server.addresses(), &[ServerAddress::Unix(path.clone())]);
    assert!(server.local_addr().is_none());

    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = String::from_utf8(read_until_close(&mut stream).await).unwrap();
    assert!(raw.ends_with("Hello from h1loop\n"));

    assert!(server.shutdown().await);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_start_rejects_invalid_options() {
    let options = ServerOptions {
        thread_count: 0,
        ..test_options()
    };
    assert!(Server::start(&options, Arc::new(HelloApp)).is_err());

    let options = ServerOptions {
        addresses: vec!["https://127.0.0.1:0".to_string()],
        ..test_options()
    };
    assert!(Server::start(&options, Arc::new(HelloApp)).is_err());

    let options = ServerOptions {
        max_request_buffer_size: Some(1024),
        ..test_options()
    };
    assert!(Server::start(&options, Arc::new(HelloApp)).is_err());
}
