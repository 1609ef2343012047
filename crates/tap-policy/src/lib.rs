use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Per-entry options. Only membership is consulted today; the option mapping
/// is reserved for future policy (`cache`, and later perhaps `regex`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AclEntryOptions {
    #[serde(default)]
    pub cache: bool,
}

/// One allow-list entry: hostname (or URL) mapped to its options.
pub type AclEntry = BTreeMap<String, AclEntryOptions>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Permit,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDecision {
    pub action: AclAction,
    pub reason: &'static str,
}

impl AclDecision {
    pub fn is_permit(&self) -> bool {
        self.action == AclAction::Permit
    }
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("failed to read ACL file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse ACL file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// The loaded allow-list, consulted once per request.
///
/// Serialized form:
/// `{"hosts":[{"<host>":{"cache":bool}},...],"urls":[{"<url>":{"cache":bool}},...]}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowMap {
    #[serde(default)]
    hosts: Vec<AclEntry>,
    #[serde(default)]
    urls: Vec<AclEntry>,
}

impl AllowMap {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AclError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| AclError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| AclError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn url_count(&self) -> usize {
        self.urls.len()
    }

    /// Hosts are consulted first, then exact URL matches, then deny.
    pub fn check(&self, host: &str, url: &str) -> AclDecision {
        if self.check_host(host) {
            debug!(host, "allowing host");
            return AclDecision {
                action: AclAction::Permit,
                reason: "allowed_host",
            };
        }
        if self.check_url(url) {
            debug!(url, "allowing url");
            return AclDecision {
                action: AclAction::Permit,
                reason: "allowed_url",
            };
        }
        debug!(url, "blocking");
        AclDecision {
            action: AclAction::Deny,
            reason: "not_in_allow_list",
        }
    }

    fn check_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|entry| entry.contains_key(host))
    }

    // TODO: compile `"regex": true` entries into a pattern table instead of
    // exact string comparison.
    fn check_url(&self, url: &str) -> bool {
        self.urls.iter().any(|entry| entry.contains_key(url))
    }
}

#[cfg(test)]
mod tests {
    use super::{AclAction, AllowMap};

    const FIXTURE: &str = r#"{
        "hosts": [
            {"example.test": {"cache": true}},
            {"api.example.test": {"cache": false}}
        ],
        "urls": [
            {"https://other.test/exact?x=1": {"cache": true}}
        ]
    }"#;

    #[test]
    fn parses_two_tier_document() {
        let acl = AllowMap::from_json(FIXTURE).expect("parse fixture");
        assert_eq!(acl.host_count(), 2);
        assert_eq!(acl.url_count(), 1);
    }

    #[test]
    fn permits_listed_host_before_consulting_urls() {
        let acl = AllowMap::from_json(FIXTURE).expect("parse fixture");
        let decision = acl.check("example.test", "https://example.test/anything");
        assert_eq!(decision.action, AclAction::Permit);
        assert_eq!(decision.reason, "allowed_host");
    }

    #[test]
    fn permits_exact_url_match_for_unlisted_host() {
        let acl = AllowMap::from_json(FIXTURE).expect("parse fixture");
        let decision = acl.check("other.test", "https://other.test/exact?x=1");
        assert_eq!(decision.action, AclAction::Permit);
        assert_eq!(decision.reason, "allowed_url");
    }

    #[test]
    fn url_match_is_exact_not_prefix() {
        let acl = AllowMap::from_json(FIXTURE).expect("parse fixture");
        let decision = acl.check("other.test", "https://other.test/exact?x=1&y=2");
        assert_eq!(decision.action, AclAction::Deny);
    }

    #[test]
    fn denies_anything_unlisted() {
        let acl = AllowMap::from_json(FIXTURE).expect("parse fixture");
        let decision = acl.check("nope.test", "https://nope.test/");
        assert_eq!(decision.action, AclAction::Deny);
        assert!(!decision.is_permit());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let acl = AllowMap::from_json("{}").expect("parse empty document");
        assert_eq!(acl.host_count(), 0);
        assert_eq!(acl.url_count(), 0);
        assert!(!acl.check("example.test", "https://example.test/").is_permit());
    }

    #[test]
    fn load_reports_missing_file_with_path() {
        let error = AllowMap::load("/nonexistent/allowmap.json").expect_err("must fail");
        assert!(error.to_string().contains("/nonexistent/allowmap.json"));
    }

    #[test]
    fn load_reads_document_from_disk() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("allowmap.json");
        std::fs::write(&path, FIXTURE).expect("write fixture");

        let acl = AllowMap::load(&path).expect("load fixture");
        assert!(acl.check("example.test", "https://example.test/").is_permit());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("allowmap.json");
        std::fs::write(&path, "{not json").expect("write fixture");

        let error = AllowMap::load(&path).expect_err("must fail");
        assert!(error.to_string().contains("parse"));
    }
}
