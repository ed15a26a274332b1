//! Process-wide client configuration.

use serde::{Deserialize, Serialize};

/// Recognized configuration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback public inboxes queried for anonymous reads.
    #[serde(default)]
    pub default_inbox_endpoints: Vec<String>,
    /// Identity-creation URL surfaced by login UIs; the protocol layer
    /// never consults it.
    #[serde(default)]
    pub identity_creator_endpoint: Option<String>,
}
