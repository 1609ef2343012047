use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime settings for both listeners. The listen addresses come from the
/// command line; everything else keeps its default unless a deployment
/// overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Front-door address clients set as HTTP_PROXY / HTTPS_PROXY.
    pub http_listen_addr: String,
    /// Internal interception endpoint CONNECT tunnels are spliced into.
    pub tls_listen_addr: String,
    pub allowmap_path: String,
    pub cache_dir: String,
    pub acl_enforce: bool,
    pub max_http_head_bytes: usize,
    pub handshake_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub upstream_tls_insecure_skip_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: "127.0.0.1:38000".to_string(),
            tls_listen_addr: "127.0.0.1:38443".to_string(),
            allowmap_path: "allowmap.json".to_string(),
            cache_dir: "data".to_string(),
            acl_enforce: true,
            max_http_head_bytes: 64 * 1024,
            handshake_timeout_secs: 5,
            dial_timeout_secs: 5,
            upstream_tls_insecure_skip_verify: false,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        if self.http_listen_addr.trim().is_empty() {
            return Err(ProxyConfigError::EmptyValue("http_listen_addr"));
        }
        if self.tls_listen_addr.trim().is_empty() {
            return Err(ProxyConfigError::EmptyValue("tls_listen_addr"));
        }
        if self.allowmap_path.trim().is_empty() {
            return Err(ProxyConfigError::EmptyValue("allowmap_path"));
        }
        if self.cache_dir.trim().is_empty() {
            return Err(ProxyConfigError::EmptyValue("cache_dir"));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ProxyConfigError::ZeroValue("max_http_head_bytes"));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ProxyConfigError::ZeroValue("handshake_timeout_secs"));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ProxyConfigError::ZeroValue("dial_timeout_secs"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyConfigError {
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::{ProxyConfig, ProxyConfigError};

    #[test]
    fn default_config_validates() {
        let config = ProxyConfig::default();
        assert_eq!(config.http_listen_addr, "127.0.0.1:38000");
        assert_eq!(config.tls_listen_addr, "127.0.0.1:38443");
        assert!(config.acl_enforce);
        config.validate().expect("default config is valid");
    }

    #[test]
    fn rejects_empty_listen_addr() {
        let config = ProxyConfig {
            http_listen_addr: " ".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::EmptyValue("http_listen_addr"))
        );
    }

    #[test]
    fn rejects_zero_head_limit() {
        let config = ProxyConfig {
            max_http_head_bytes: 0,
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::ZeroValue("max_http_head_bytes"))
        );
    }

    #[test]
    fn deserializes_partial_document_over_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"acl_enforce": false, "cache_dir": "tmp-cache"}"#)
                .expect("parse partial config");
        assert!(!config.acl_enforce);
        assert_eq!(config.cache_dir, "tmp-cache");
        assert_eq!(config.http_listen_addr, "127.0.0.1:38000");
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(serde_json::from_str::<ProxyConfig>(r#"{"no_such_knob": 1}"#).is_err());
    }
}
