use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use url::Url;

/// The single upstream origin a proxy instance forwards to, pinned for the
/// lifetime of the process. Only scheme + host + port are kept; any path,
/// query, or fragment in the configured value is discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamOrigin {
    origin: String,
    authority: String,
    https: bool,
}

impl UpstreamOrigin {
    /// Parse and validate the configured upstream origin. Runs exactly once
    /// at startup; an error here must prevent the listener from binding.
    pub fn resolve(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid upstream origin: {raw}"))?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => bail!("unsupported upstream scheme {other:?} (expected http or https)"),
        };
        let host = url
            .host_str()
            .with_context(|| format!("upstream origin has no host: {raw}"))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            origin: format!("{}://{}", url.scheme(), authority),
            authority,
            https,
        })
    }

    /// Origin in `scheme://host[:port]` form, no trailing slash.
    pub fn as_str(&self) -> &str {
        &self.origin
    }

    /// `host[:port]` value for the rewritten Host header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_https(&self) -> bool {
        self.https
    }
}

impl std::fmt::Display for UpstreamOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.origin)
    }
}

/// Immutable per-instance configuration, created once in `main` and shared
/// into every handler. Never mutated after creation.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub upstream: UpstreamOrigin,
    /// Origin allowed to embed the proxied content in an iframe.
    pub allow_origin: String,
}
