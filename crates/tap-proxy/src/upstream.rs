//! HTTP/1.1 upstream client used by both listeners. One request per
//! connection; the full response is captured in wire form so it can be
//! replayed to the client and persisted unchanged.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http1::{parse_response_head, read_body_raw, read_head, BufferedConn, ResponseHead};

#[derive(Debug)]
pub struct UpstreamResponse {
    pub head: ResponseHead,
    /// Status line, headers, and body exactly as they arrived.
    pub wire: Vec<u8>,
}

pub async fn fetch_plain(
    host: &str,
    port: u16,
    request: &[u8],
    request_method: &str,
    dial_timeout: Duration,
    max_head_bytes: usize,
) -> io::Result<UpstreamResponse> {
    let stream = dial(host, port, dial_timeout).await?;
    exchange(stream, request, request_method, max_head_bytes).await
}

pub async fn fetch_tls(
    host: &str,
    port: u16,
    sni: &str,
    client_config: Arc<ClientConfig>,
    request: &[u8],
    request_method: &str,
    dial_timeout: Duration,
    max_head_bytes: usize,
) -> io::Result<UpstreamResponse> {
    let tcp = dial(host, port, dial_timeout).await?;
    let server_name = ServerName::try_from(sni.to_string()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid server name for upstream TLS",
        )
    })?;
    let connector = TlsConnector::from(client_config);
    let tls = connector.connect(server_name, tcp).await?;
    exchange(tls, request, request_method, max_head_bytes).await
}

async fn dial(host: &str, port: u16, dial_timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(dial_timeout, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("upstream dial to {host}:{port} timed out"),
        )),
    }
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    request: &[u8],
    request_method: &str,
    max_head_bytes: usize,
) -> io::Result<UpstreamResponse> {
    let mut conn = BufferedConn::new(stream);
    conn.stream.write_all(request).await?;
    conn.stream.flush().await?;

    let head_raw = read_head(&mut conn, max_head_bytes).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed before response headers",
        )
    })?;
    let head = parse_response_head(&head_raw, request_method)?;
    let body = read_body_raw(&mut conn, head.body_mode, max_head_bytes).await?;

    let mut wire = Vec::with_capacity(head.raw.len() + body.len());
    wire.extend_from_slice(&head.raw);
    wire.extend_from_slice(&body);

    Ok(UpstreamResponse { head, wire })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::fetch_plain;

    #[tokio::test]
    async fn fetch_plain_captures_full_wire_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        let origin = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = vec![0_u8; 1024];
            let read = stream.read(&mut request).await.expect("read request");
            assert!(request[..read].starts_with(b"GET /hello HTTP/1.1"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld")
                .await
                .expect("write response");
        });

        let request = b"GET /hello HTTP/1.1\r\nHost: origin\r\nConnection: close\r\n\r\n";
        let response = fetch_plain(
            "127.0.0.1",
            addr.port(),
            request,
            "GET",
            Duration::from_secs(5),
            64 * 1024,
        )
        .await
        .expect("fetch");

        assert_eq!(response.head.status_code, 200);
        assert!(response.wire.starts_with(b"HTTP/1.1 200 OK"));
        assert!(response.wire.ends_with(b"world"));
        origin.await.expect("origin task");
    }

    #[tokio::test]
    async fn fetch_plain_fails_when_upstream_is_unreachable() {
        // Bind then drop a listener so the port is known-closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let error = fetch_plain(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
            "GET",
            Duration::from_millis(200),
            64 * 1024,
        )
        .await
        .expect_err("dial must fail");
        assert!(
            error.kind() == std::io::ErrorKind::ConnectionRefused
                || error.kind() == std::io::ErrorKind::TimedOut,
            "{error}"
        );
    }
}
