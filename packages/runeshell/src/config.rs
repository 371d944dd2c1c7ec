//! Runtime configuration for the hub and agent processes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How client connections are authorized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Clients present a signed token issued via `/api/ws-token`.
    Token,
    /// Clients are trusted by network position (loopback / tailnet).
    Tailnet,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub auth_mode: AuthMode,
    /// Reject peers outside loopback and 100.64.0.0/10 regardless of mode.
    pub tailnet_only: bool,
    pub admin_token: String,
    pub token_ttl_secs: u64,
    /// Pre-shared agent credentials: agent id → secret.
    pub agent_secrets: HashMap<String, String>,
}

impl HubConfig {
    pub fn token_ttl(&self) -> Duration {
        if self.token_ttl_secs == 0 {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(self.token_ttl_secs)
        }
    }

    pub fn agent_secret_matches(&self, agent_id: &str, secret: &str) -> bool {
        if agent_id.is_empty() {
            return false;
        }
        self.agent_secrets
            .get(agent_id)
            .is_some_and(|expected| expected == secret)
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Hub agent endpoint, e.g. `ws://localhost:8081/ws/agent`.
    pub hub_url: String,
    pub agent_id: String,
    pub agent_secret: String,
    /// Delay between reconnect attempts; zero falls back to 2 s.
    pub retry: Duration,
}
