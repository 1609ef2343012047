//! The plain-text front door. Clients point HTTP_PROXY / HTTPS_PROXY here:
//! CONNECT tunnels are spliced blindly into the internal interception
//! endpoint, and absolute-URI GET/HEAD requests are proxied directly.

use std::io;
use std::sync::Arc;

use tap_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::http1::{parse_request_head, read_head, BufferedConn, RequestHead};
use crate::{emit_stream_closed, unknown_context, CloseReason, ProxyShared};

pub struct FrontDoor<S: EventSink + 'static> {
    shared: Arc<ProxyShared<S>>,
}

impl<S: EventSink + 'static> FrontDoor<S> {
    pub fn new(shared: Arc<ProxyShared<S>>) -> Self {
        Self { shared }
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.shared.config.http_listen_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(error) = handle_client(shared, stream, client_addr.to_string()).await {
                    warn!(%client_addr, %error, "front-door connection failed");
                }
            });
        }
    }
}

async fn handle_client<S: EventSink>(
    shared: Arc<ProxyShared<S>>,
    stream: TcpStream,
    client_addr: String,
) -> io::Result<()> {
    let mut conn = BufferedConn::new(stream);

    let head_raw = match read_head(&mut conn, shared.config.max_http_head_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            if error.kind() != io::ErrorKind::UnexpectedEof {
                write_proxy_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid or incomplete proxy request",
                )
                .await?;
            }
            return Ok(());
        }
    };

    let request = match parse_request_head(&head_raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            let flow_id = shared.allocate_flow_id();
            emit_stream_closed(
                &shared,
                unknown_context(flow_id, client_addr),
                CloseReason::RequestParseFailed,
                Some(error.to_string()),
            );
            write_proxy_response(&mut conn.stream, "400 Bad Request", "invalid proxy request")
                .await?;
            return Ok(());
        }
    };

    match request.method.as_str() {
        "CONNECT" => handle_connect(shared, conn, client_addr, request).await,
        "GET" | "HEAD" => handle_plain(shared, conn, client_addr, request).await,
        _ => {
            let flow_id = shared.allocate_flow_id();
            emit_stream_closed(
                &shared,
                unknown_context(flow_id, client_addr),
                CloseReason::NotImplemented,
                Some(request.method.clone()),
            );
            write_proxy_response(
                &mut conn.stream,
                "501 Not Implemented",
                "Only GET, HEAD, and CONNECT are supported at the moment",
            )
            .await
        }
    }
}

/// CONNECT never dials the requested authority. The tunnel is spliced into
/// the internal interception endpoint, which recovers the intended host from
/// the client's SNI.
async fn handle_connect<S: EventSink>(
    shared: Arc<ProxyShared<S>>,
    mut conn: BufferedConn<TcpStream>,
    client_addr: String,
    request: RequestHead,
) -> io::Result<()> {
    let context = FlowContext {
        flow_id: shared.allocate_flow_id(),
        client_addr,
        host: request.target.clone(),
    };
    shared.emit(
        Event::new(EventType::ConnectReceived, context.clone())
            .with_attribute("authority", request.target.clone()),
    );
    debug!(authority = %request.target, "CONNECT");

    let endpoint = &shared.config.tls_listen_addr;
    let dial = TcpStream::connect(endpoint);
    let mut upstream = match tokio::time::timeout(shared.config.dial_timeout(), dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            write_proxy_response(&mut conn.stream, "503 Service Unavailable", &error.to_string())
                .await?;
            emit_stream_closed(
                &shared,
                context,
                CloseReason::InternalDialFailed,
                Some(error.to_string()),
            );
            return Ok(());
        }
        Err(_) => {
            let detail = format!("dial to interception endpoint {endpoint} timed out");
            write_proxy_response(&mut conn.stream, "503 Service Unavailable", &detail).await?;
            emit_stream_closed(&shared, context, CloseReason::InternalDialFailed, Some(detail));
            return Ok(());
        }
    };

    conn.stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

    // Client bytes that arrived behind the CONNECT head belong to the tunnel.
    if !conn.read_buf.is_empty() {
        upstream.write_all(&conn.read_buf).await?;
    }

    match tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream).await {
        Ok((from_client, from_server)) => {
            let mut event = Event::new(EventType::StreamClosed, context)
                .with_attribute("reason_code", CloseReason::RelayEof.as_str());
            event
                .attributes
                .insert("bytes_from_client".to_string(), from_client.to_string());
            event
                .attributes
                .insert("bytes_from_server".to_string(), from_server.to_string());
            shared.emit(event);
            Ok(())
        }
        Err(error) => {
            emit_stream_closed(
                &shared,
                context,
                CloseReason::RelayError,
                Some(error.to_string()),
            );
            Err(error)
        }
    }
}

/// Absolute-URI GET/HEAD proxying over plain HTTP. No caching happens here.
async fn handle_plain<S: EventSink>(
    shared: Arc<ProxyShared<S>>,
    mut conn: BufferedConn<TcpStream>,
    client_addr: String,
    request: RequestHead,
) -> io::Result<()> {
    let flow_id = shared.allocate_flow_id();

    let uri = match request.target.parse::<http::Uri>() {
        Ok(uri) if uri.scheme_str() == Some("http") && uri.host().is_some() => uri,
        Ok(uri) if uri.scheme_str() == Some("https") => {
            // HTTPS traffic arrives via CONNECT; an absolute https URI on the
            // plain path is not proxied.
            emit_stream_closed(
                &shared,
                unknown_context(flow_id, client_addr),
                CloseReason::NotImplemented,
                Some(uri.to_string()),
            );
            return write_proxy_response(
                &mut conn.stream,
                "501 Not Implemented",
                "https requests must use CONNECT",
            )
            .await;
        }
        _ => {
            emit_stream_closed(
                &shared,
                unknown_context(flow_id, client_addr),
                CloseReason::RequestParseFailed,
                Some(request.target.clone()),
            );
            return write_proxy_response(
                &mut conn.stream,
                "400 Bad Request",
                "proxy requests require an absolute http URI",
            )
            .await;
        }
    };

    let host = uri.host().unwrap_or_default().to_string();
    let port = uri.port_u16().unwrap_or(80);
    let authority = uri
        .authority()
        .map(|authority| authority.as_str().to_string())
        .unwrap_or_else(|| host.clone());
    let url = uri.to_string();

    let context = FlowContext {
        flow_id,
        client_addr,
        host: host.clone(),
    };
    shared.emit(
        Event::new(EventType::PlainRequest, context.clone())
            .with_attribute("method", request.method.clone())
            .with_attribute("url", url.clone()),
    );
    debug!(method = %request.method, %url, "plain proxy request");

    if shared.config.acl_enforce {
        let decision = shared.acl.check(&host, &url);
        if !decision.is_permit() {
            shared.emit(
                Event::new(EventType::AclDenied, context.clone())
                    .with_attribute("url", url.clone()),
            );
            emit_stream_closed(
                &shared,
                context,
                CloseReason::Blocked,
                Some(decision.reason.to_string()),
            );
            return write_proxy_response(
                &mut conn.stream,
                "403 Forbidden",
                "request blocked by proxy ACL",
            )
            .await;
        }
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        request.method, path_and_query, authority
    );

    let response = match crate::upstream::fetch_plain(
        &host,
        port,
        upstream_request.as_bytes(),
        &request.method,
        shared.config.dial_timeout(),
        shared.config.max_http_head_bytes,
    )
    .await
    {
        Ok(response) => response,
        Err(error) => {
            shared.emit(
                Event::new(EventType::UpstreamFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                &shared,
                context,
                CloseReason::UpstreamFetchFailed,
                Some(error.to_string()),
            );
            let detail = format!("error requesting {url}");
            return write_proxy_response(&mut conn.stream, "502 Bad Gateway", &detail).await;
        }
    };

    conn.stream.write_all(&response.wire).await?;
    let _ = conn.stream.shutdown().await;

    let mut event = Event::new(EventType::StreamClosed, context)
        .with_attribute("reason_code", CloseReason::Responded.as_str());
    event.attributes.insert(
        "bytes_from_server".to_string(),
        response.wire.len().to_string(),
    );
    shared.emit(event);
    Ok(())
}

async fn write_proxy_response(
    stream: &mut TcpStream,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}
