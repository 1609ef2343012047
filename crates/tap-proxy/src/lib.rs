pub mod config;
pub mod front_door;
pub mod http1;
pub mod interceptor;
pub mod upstream;

pub use config::{ProxyConfig, ProxyConfigError};
pub use front_door::FrontDoor;
pub use interceptor::Interceptor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tap_observe::{Event, EventSink, EventType, FlowContext};
use tap_policy::AllowMap;

/// State both listeners share: the runtime settings, the loaded allow-list,
/// the event sink, and the flow-id counter.
pub struct ProxyShared<S: EventSink> {
    pub config: ProxyConfig,
    pub acl: Arc<AllowMap>,
    sink: Arc<S>,
    next_flow_id: AtomicU64,
}

impl<S: EventSink> ProxyShared<S> {
    pub fn new(config: ProxyConfig, acl: Arc<AllowMap>, sink: Arc<S>) -> Self {
        Self {
            config,
            acl,
            sink,
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit(&self, event: Event) {
        self.sink.emit(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Blocked,
    RequestParseFailed,
    NotImplemented,
    InternalDialFailed,
    TlsHandshakeFailed,
    UpstreamFetchFailed,
    CacheHitServed,
    Responded,
    RelayEof,
    RelayError,
}

impl CloseReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::RequestParseFailed => "request_parse_failed",
            Self::NotImplemented => "not_implemented",
            Self::InternalDialFailed => "internal_dial_failed",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::UpstreamFetchFailed => "upstream_fetch_failed",
            Self::CacheHitServed => "cache_hit_served",
            Self::Responded => "responded",
            Self::RelayEof => "relay_eof",
            Self::RelayError => "relay_error",
        }
    }
}

pub(crate) fn emit_stream_closed<S: EventSink>(
    shared: &ProxyShared<S>,
    context: FlowContext,
    reason: CloseReason,
    detail: Option<String>,
) {
    let mut event =
        Event::new(EventType::StreamClosed, context).with_attribute("reason_code", reason.as_str());
    if let Some(detail) = detail {
        event.attributes.insert("reason_detail".to_string(), detail);
    }
    shared.emit(event);
}

pub(crate) fn unknown_context(flow_id: u64, client_addr: String) -> FlowContext {
    FlowContext {
        flow_id,
        client_addr,
        host: "<unknown>".to_string(),
    }
}
