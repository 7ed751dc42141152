//! Ingress routing entries
//!
//! Rewriters translate controller-specific Ingress manifests into these
//! flat route entries; the Caddyfile assembler groups them into one site
//! block per host.

use serde::{Deserialize, Serialize};

/// Backend scheme of a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP upstream
    #[default]
    Http,
    /// TLS upstream; the proxy directive carries `transport http { tls }`
    Https,
}

/// One route of a Caddy site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressEntry {
    /// Site host
    pub host: String,
    /// Path prefix; `/` is the catch-all
    pub path: String,
    /// Upstream `host:port`
    pub upstream: String,
    /// Backend scheme
    #[serde(default)]
    pub scheme: Scheme,
    /// Strip this prefix before proxying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<String>,
    /// Raw Caddy directives appended to the site block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_directives: Vec<String>,
}

impl IngressEntry {
    /// Create a plain HTTP route.
    pub fn new(host: impl Into<String>, path: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            upstream: upstream.into(),
            ..Default::default()
        }
    }

    /// The upstream's host component (everything before the port).
    pub fn upstream_host(&self) -> &str {
        self.upstream.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.upstream)
    }
}
