//! Room naming and endpoint resolution.

use std::fmt;
use url::Url;

pub const DEFAULT_ROOM_PREFIX: &str = "document-";

/// Name of the shared room a document is edited in. Every participant
/// editing the same document derives the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn for_document(prefix: &str, document_id: &str) -> Self {
        Self(format!("{prefix}{document_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Maps a document to the raw endpoint its room is served from.
pub trait EndpointResolver: Send + Sync {
    /// `None` means collaboration is not configured for this document.
    fn resolve(&self, document_id: &str) -> Option<String>;
}

/// `"{base}/{document_id}"`; no base configured means no endpoint.
#[derive(Debug, Clone, Default)]
pub struct BaseUrlResolver {
    base: Option<String>,
}

impl BaseUrlResolver {
    pub fn new(base: Option<String>) -> Self {
        Self {
            base: base.filter(|b| !b.trim().is_empty()),
        }
    }
}

impl EndpointResolver for BaseUrlResolver {
    fn resolve(&self, document_id: &str) -> Option<String> {
        let base = self.base.as_deref()?.trim_end_matches('/');
        Some(format!("{base}/{document_id}"))
    }
}

/// Any closure works as a resolver.
impl<F> EndpointResolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, document_id: &str) -> Option<String> {
        self(document_id)
    }
}

/// Turn whatever the resolver produced into a `ws://` or `wss://` URL.
///
/// `origin` is the page (or service) origin used for relative paths and
/// scheme-less hosts, e.g. `https://editor.example.com`.
pub fn normalize_ws_url(raw: &str, origin: Option<&str>) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return Some(trimmed.to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }

    let origin = origin.and_then(|o| Url::parse(o).ok());
    let scheme = match origin.as_ref().map(Url::scheme) {
        Some("https") => "wss",
        _ => "ws",
    };

    if trimmed.starts_with('/') {
        let Some(host) = origin.as_ref().and_then(origin_host) else {
            log::warn!("Relative endpoint {trimmed} needs an origin");
            return None;
        };
        return Some(format!("{scheme}://{host}{trimmed}"));
    }

    Some(format!("{scheme}://{trimmed}"))
}

fn origin_host(origin: &Url) -> Option<String> {
    let host = origin.host_str()?;
    Some(match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
