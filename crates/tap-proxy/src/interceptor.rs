//! The internal TLS-terminating interceptor. CONNECT tunnels land here; the
//! handshake is completed with a leaf minted for the client's SNI, one
//! request is read off the decrypted stream, and the response comes from the
//! cache or from a live upstream fetch.

use std::io;
use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use tap_cache::{fingerprint, ResponseCache};
use tap_observe::{Event, EventSink, EventType, FlowContext};
use tap_tls::{interceptor_server_config, upstream_client_config, LeafStore};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::http1::{
    parse_request_head, read_body_raw, read_head, BufferedConn, RequestHead, ResponseHead,
};
use crate::{emit_stream_closed, unknown_context, CloseReason, ProxyShared};

pub struct Interceptor<S: EventSink + 'static> {
    shared: Arc<ProxyShared<S>>,
    leaf_store: Arc<LeafStore>,
    cache: Arc<ResponseCache>,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl<S: EventSink + 'static> Interceptor<S> {
    pub fn new(
        shared: Arc<ProxyShared<S>>,
        leaf_store: Arc<LeafStore>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let server_config = interceptor_server_config(Arc::clone(&leaf_store));
        let client_config =
            upstream_client_config(shared.config.upstream_tls_insecure_skip_verify);
        Self {
            shared,
            leaf_store,
            cache,
            server_config,
            client_config,
        }
    }

    pub fn leaf_store(&self) -> Arc<LeafStore> {
        Arc::clone(&self.leaf_store)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.shared.config.tls_listen_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let handles = Arc::new(InterceptHandles {
            shared: Arc::clone(&self.shared),
            cache: Arc::clone(&self.cache),
            server_config: Arc::clone(&self.server_config),
            client_config: Arc::clone(&self.client_config),
        });

        loop {
            let (stream, client_addr) = listener.accept().await?;
            let handles = Arc::clone(&handles);
            tokio::spawn(async move {
                if let Err(error) =
                    handle_client(handles, stream, client_addr.to_string()).await
                {
                    warn!(%client_addr, %error, "intercepted connection failed");
                }
            });
        }
    }
}

struct InterceptHandles<S: EventSink> {
    shared: Arc<ProxyShared<S>>,
    cache: Arc<ResponseCache>,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

async fn handle_client<S: EventSink>(
    handles: Arc<InterceptHandles<S>>,
    stream: TcpStream,
    client_addr: String,
) -> io::Result<()> {
    let shared = &handles.shared;
    let flow_id = shared.allocate_flow_id();

    let acceptor = TlsAcceptor::from(Arc::clone(&handles.server_config));
    let accept = acceptor.accept(stream);
    let tls = match tokio::time::timeout(shared.config.handshake_timeout(), accept).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(error)) => {
            shared.emit(
                Event::new(
                    EventType::TlsHandshakeFailed,
                    unknown_context(flow_id, client_addr.clone()),
                )
                .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                shared,
                unknown_context(flow_id, client_addr),
                CloseReason::TlsHandshakeFailed,
                Some(error.to_string()),
            );
            return Ok(());
        }
        Err(_) => {
            let detail = "handshake deadline exceeded".to_string();
            shared.emit(
                Event::new(
                    EventType::TlsHandshakeFailed,
                    unknown_context(flow_id, client_addr.clone()),
                )
                .with_attribute("detail", detail.clone()),
            );
            emit_stream_closed(
                shared,
                unknown_context(flow_id, client_addr),
                CloseReason::TlsHandshakeFailed,
                Some(detail),
            );
            return Ok(());
        }
    };

    let mut conn = BufferedConn::new(tls);

    // Exactly one request per tunnel; keep-alive is not supported here.
    let head_raw = match read_head(&mut conn, shared.config.max_http_head_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            emit_stream_closed(
                shared,
                unknown_context(flow_id, client_addr),
                CloseReason::RequestParseFailed,
                Some(error.to_string()),
            );
            return Ok(());
        }
    };
    let request = match parse_request_head(&head_raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            emit_stream_closed(
                shared,
                unknown_context(flow_id, client_addr),
                CloseReason::RequestParseFailed,
                Some(error.to_string()),
            );
            return Ok(());
        }
    };
    let body_raw = match read_body_raw(
        &mut conn,
        request.body_mode,
        shared.config.max_http_head_bytes,
    )
    .await
    {
        Ok(body) => body,
        Err(error) => {
            emit_stream_closed(
                shared,
                unknown_context(flow_id, client_addr),
                CloseReason::RequestParseFailed,
                Some(error.to_string()),
            );
            return Ok(());
        }
    };

    let Some(host) = request.host().map(str::to_string) else {
        emit_stream_closed(
            shared,
            unknown_context(flow_id, client_addr),
            CloseReason::RequestParseFailed,
            Some("missing Host header".to_string()),
        );
        return Ok(());
    };

    // Client-form rewrite: the tunnel target was discarded at the front
    // door, so the URL is reconstructed from the Host header.
    let url = if request.target.starts_with('/') {
        format!("https://{}{}", host, request.target)
    } else {
        request.target.clone()
    };
    let (server_host, server_port) = split_host_port(&host);

    let context = FlowContext {
        flow_id,
        client_addr,
        host: server_host.clone(),
    };

    let mut intercepted = Event::new(EventType::RequestIntercepted, context.clone())
        .with_attribute("method", request.method.clone())
        .with_attribute("url", url.clone());
    if let Some(forwarded_for) = request.header("x-forwarded-for") {
        intercepted = intercepted.with_attribute("x_forwarded_for", forwarded_for);
    }
    shared.emit(intercepted);
    info!(method = %request.method, %url, "intercepted request");

    if shared.config.acl_enforce {
        let decision = shared.acl.check(&server_host, &url);
        if !decision.is_permit() {
            shared.emit(
                Event::new(EventType::AclDenied, context.clone())
                    .with_attribute("url", url.clone()),
            );
            emit_stream_closed(
                shared,
                context,
                CloseReason::Blocked,
                Some(decision.reason.to_string()),
            );
            // Denied tunnels close without a response.
            return Ok(());
        }
    }

    // POST without a query string opts out of caching entirely.
    let participates = request.method != "POST" || !request.raw_query().is_empty();
    let fp = participates.then(|| fingerprint(&request.method, &url));

    if let Some(fp) = &fp {
        if handles.cache.exists(fp) {
            match handles.cache.read(fp) {
                Ok(bytes) => {
                    shared.emit(
                        Event::new(EventType::CacheHit, context.clone())
                            .with_attribute("fingerprint", fp.clone())
                            .with_attribute("bytes", bytes.len().to_string()),
                    );
                    conn.stream.write_all(&bytes).await?;
                    let _ = conn.stream.shutdown().await;
                    emit_stream_closed(shared, context, CloseReason::CacheHitServed, None);
                    return Ok(());
                }
                Err(error) => {
                    warn!(fingerprint = %fp, %error, "cache read failed; fetching live");
                }
            }
        }
        shared.emit(
            Event::new(EventType::CacheMiss, context.clone())
                .with_attribute("fingerprint", fp.clone()),
        );
    }

    let mut upstream_request = Vec::with_capacity(request.raw.len() + body_raw.len());
    upstream_request.extend_from_slice(&request.raw);
    upstream_request.extend_from_slice(&body_raw);

    let response = match crate::upstream::fetch_tls(
        &server_host,
        server_port,
        &server_host,
        Arc::clone(&handles.client_config),
        &upstream_request,
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
                shared,
                context,
                CloseReason::UpstreamFetchFailed,
                Some(error.to_string()),
            );
            // No response is synthesized inside the tunnel.
            return Ok(());
        }
    };

    store_if_cacheable(&handles, &context, &request, &response, fp.as_deref());

    conn.stream.write_all(&response.wire).await?;
    let _ = conn.stream.shutdown().await;
    emit_stream_closed(shared, context, CloseReason::Responded, None);
    Ok(())
}

fn store_if_cacheable<S: EventSink>(
    handles: &InterceptHandles<S>,
    context: &FlowContext,
    request: &RequestHead,
    response: &crate::upstream::UpstreamResponse,
    fp: Option<&str>,
) {
    let shared = &handles.shared;

    let Some(fp) = fp else {
        shared.emit(
            Event::new(EventType::CacheStoreSkipped, context.clone())
                .with_attribute("reason", "post_without_query"),
        );
        return;
    };
    if request.method == "POST" {
        shared.emit(
            Event::new(EventType::CacheStoreSkipped, context.clone())
                .with_attribute("reason", "post_request"),
        );
        return;
    }
    if no_cache(&response.head) {
        shared.emit(
            Event::new(EventType::CacheStoreSkipped, context.clone())
                .with_attribute("reason", "no_cache_response"),
        );
        return;
    }

    match handles.cache.write(fp, &response.wire) {
        Ok(()) => {
            shared.emit(
                Event::new(EventType::CacheStored, context.clone())
                    .with_attribute("fingerprint", fp)
                    .with_attribute("bytes", response.wire.len().to_string()),
            );
        }
        Err(error) => {
            // Cache failures never reach the client.
            warn!(fingerprint = %fp, %error, "cache write failed");
        }
    }
}

fn no_cache(head: &ResponseHead) -> bool {
    head.headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("cache-control"))
        .any(|header| header.value.contains("no-cache"))
}

/// Splits a Host header value into hostname and port, defaulting to 443.
fn split_host_port(host: &str) -> (String, u16) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inside, suffix)) = rest.split_once(']') {
            let port = suffix
                .strip_prefix(':')
                .and_then(|text| text.parse().ok())
                .unwrap_or(443);
            return (inside.to_string(), port);
        }
        return (host.to_string(), 443);
    }

    match host.rsplit_once(':') {
        Some((name, port_text)) if !name.contains(':') => match port_text.parse() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), 443),
        },
        _ => (host.to_string(), 443),
    }
}
