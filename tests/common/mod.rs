#![allow(dead_code)]

use std::sync::Arc;

use h1loop::Application;
use h1loop::http::connection::{Connection, ConnectionId, ConnectionSettings};
use h1loop::http::context::ConnectionInfo;
use h1loop::memory::MemoryPool;
use h1loop::socket::ConnectionControl;
use std::rc::Rc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, DuplexStream};

/// Response as seen by a client.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Start a connection over an in-memory pipe. Call from inside a `LocalSet`.
pub fn connect(
    app: Arc<dyn Application>,
    settings: ConnectionSettings,
) -> (DuplexStream, Rc<dyn ConnectionControl>) {
    connect_with_pool(app, settings, MemoryPool::new())
}

/// Like `connect`, with a pool the test can inspect.
pub fn connect_with_pool(
    app: Arc<dyn Application>,
    settings: ConnectionSettings,
    pool: MemoryPool,
) -> (DuplexStream, Rc<dyn ConnectionControl>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let connection = Connection::new(
        ConnectionInfo::new(ConnectionId(1)),
        pool,
        app,
        Arc::new(settings),
    );
    let control = connection.control();
    tokio::task::spawn_local(connection.run(server));
    (client, control)
}

/// Read one response head and its body. HEAD responses must pass
/// `bodyless = true`.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    bodyless: bool,
) -> RawResponse {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let mut parts = line.trim_end().splitn(3, ' ');
    assert_eq!(parts.next(), Some("HTTP/1.1"), "status line: {line:?}");
    let status: u16 = parts.next().unwrap().parse().unwrap();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut response = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };
    if bodyless || status == 204 || status == 304 || status < 200 {
        return response;
    }

    if response
        .header("Transfer-Encoding")
        .and_then(|te| te.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
    {
        response.body = read_chunked(reader).await;
    } else if let Some(length) = response.header("Content-Length") {
        let mut body = vec![0u8; length.parse().unwrap()];
        reader.read_exact(&mut body).await.unwrap();
        response.body = body;
    } else {
        reader.read_to_end(&mut response.body).await.unwrap();
    }
    response
}

async fn read_chunked<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let size = usize::from_str_radix(line.trim_end(), 16).unwrap();
        if size == 0 {
            let mut end = String::new();
            reader.read_line(&mut end).await.unwrap();
            assert_eq!(end, "\r\n");
            return body;
        }
        let mut chunk = vec![0u8; size + 2];
        reader.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk[size..], b"\r\n");
        body.extend_from_slice(&chunk[..size]);
    }
}

/// Everything the server sends until it closes the connection.
pub async fn read_until_close<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}
