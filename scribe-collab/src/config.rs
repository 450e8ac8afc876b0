//! Session configuration.
//!
//! Missing configuration is never an error: without an endpoint the
//! session simply does not start and the editor stays local-only.

use std::time::Duration;

use crate::presence::{ColorPalette, DEFAULT_PALETTE};
use crate::reconcile::StalenessRule;
use crate::room::DEFAULT_ROOM_PREFIX;

/// Base websocket endpoint. The document id is appended.
pub const ENV_WS_URL: &str = "SCRIBE_COLLAB_WS_URL";
/// Origin used to resolve relative endpoints and pick `ws` vs `wss`.
pub const ENV_ORIGIN: &str = "SCRIBE_COLLAB_ORIGIN";

/// Top-level configuration for opening sync sessions.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Base endpoint (`None` = collaboration disabled)
    pub endpoint: Option<String>,
    /// Origin for relative endpoints
    pub origin: Option<String>,
    /// Prefix prepended to document ids to form room names
    pub room_prefix: String,
    pub timing: SessionTiming,
    pub transport: TransportConfig,
    /// Colors handed out to participants
    pub palette: Vec<String>,
    pub staleness: StalenessRule,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            origin: None,
            room_prefix: DEFAULT_ROOM_PREFIX.to_string(),
            timing: SessionTiming::default(),
            transport: TransportConfig::default(),
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
            staleness: StalenessRule::default(),
        }
    }
}

impl CollabConfig {
    /// Defaults, with endpoint and origin read from the process
    /// environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, with endpoint and origin read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let config = Self {
            endpoint: non_blank(ENV_WS_URL),
            origin: non_blank(ENV_ORIGIN),
            ..Self::default()
        };
        if config.endpoint.is_none() {
            log::info!("{ENV_WS_URL} not set, collaboration disabled");
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn color_palette(&self) -> ColorPalette {
        ColorPalette::new(self.palette.clone())
    }
}

/// Delays and budgets of the session's timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// Quiet period before a presence burst is reported
    pub presence_debounce: Duration,
    /// How many times to wait for the editing surface
    pub surface_wait_attempts: u32,
    pub surface_wait_interval: Duration,
    /// Pause between seeing the surface and deciding on content
    pub settle_delay: Duration,
    /// First presence report, even if nothing changed
    pub initial_presence_delay: Duration,
    /// Re-publish local presence this often while connected
    pub presence_renew_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            presence_debounce: Duration::from_millis(200),
            surface_wait_attempts: 10,
            surface_wait_interval: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            initial_presence_delay: Duration::from_secs(1),
            presence_renew_interval: Duration::from_secs(15),
        }
    }
}

/// Connection-level knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Heartbeat ping interval
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
    /// Local updates kept while disconnected
    pub offline_queue_capacity: usize,
    /// Remote participants silent for this long are dropped
    pub presence_timeout: Duration,
}

impl TransportConfig {
    /// How often stale presence is swept.
    pub fn presence_sweep_interval(&self) -> Duration {
        (self.presence_timeout / 2).max(Duration::from_millis(1))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(2500),
            offline_queue_capacity: 10_000,
            presence_timeout: Duration::from_secs(30),
        }
    }
}
