use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tap_cache::ResponseCache;
use tap_observe::NoopEventSink;
use tap_policy::AllowMap;
use tap_proxy::{FrontDoor, Interceptor, ProxyConfig, ProxyShared};
use tap_tls::{CaConfig, LeafAuthority, LeafStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tap-proxy", about = "Intercepting HTTPS proxy with response caching")]
struct Args {
    /// Address to listen on for HTTP_PROXY connections
    #[arg(long = "httpListenAddr", default_value = "127.0.0.1:38000")]
    http_listen_addr: String,
    /// Address to listen on for internal CONNECT proxy connections
    #[arg(long = "tlsListenAddr", default_value = "127.0.0.1:38443")]
    tls_listen_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ProxyConfig {
        http_listen_addr: args.http_listen_addr,
        tls_listen_addr: args.tls_listen_addr,
        ..ProxyConfig::default()
    };
    config.validate().context("invalid proxy configuration")?;

    let ca = CaConfig::from_env().context("loading CA key pair from environment")?;
    let authority = LeafAuthority::new(&ca).context("parsing CA key pair")?;
    let leaf_store = Arc::new(LeafStore::new(authority));

    let acl = AllowMap::load(&config.allowmap_path)
        .with_context(|| format!("loading ACLs from {}", config.allowmap_path))?;
    info!(
        hosts = acl.host_count(),
        urls = acl.url_count(),
        "loaded ACLs"
    );

    let cache = ResponseCache::open(&config.cache_dir)
        .with_context(|| format!("opening response cache at {}", config.cache_dir))?;

    let shared = Arc::new(ProxyShared::new(
        config.clone(),
        Arc::new(acl),
        Arc::new(NoopEventSink),
    ));
    let front_door = FrontDoor::new(Arc::clone(&shared));
    let interceptor = Interceptor::new(shared, leaf_store, Arc::new(cache));

    info!(addr = %config.http_listen_addr, "httpProxy listening");
    info!(addr = %config.tls_listen_addr, "tlsProxy listening");

    tokio::try_join!(front_door.run(), interceptor.run())
        .context("proxy listener terminated")?;
    Ok(())
}
