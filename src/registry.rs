//! Authoritative per-platform connection state.
//!
//! Platforms are created from static configuration at startup and
//! never destroyed; the registry is the only writer of their state.
//! Connect/disconnect requests go through the `PlatformCommander`
//! seam as independent request/response exchanges, outside the
//! persistent backend channel. Status pushes arriving over the
//! channel overwrite the connectivity flag and are the source of
//! truth for connectivity this process did not itself change.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PlatformConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformState {
    Offline,
    Connecting,
    Online,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Platform {
    pub key: String,
    pub display_name: String,
    pub state: PlatformState,
    pub last_transition: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a connect/disconnect exchange with a platform's control
/// endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Request/response seam to the platform control backends. Production
/// uses HTTP; tests use in-memory stubs.
#[async_trait]
pub trait PlatformCommander: Send + Sync {
    async fn connect(&self, key: &str) -> anyhow::Result<CommandOutcome>;
    async fn disconnect(&self, key: &str) -> anyhow::Result<CommandOutcome>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("platform {key} rejected {action}: {reason}")]
    CommandRejected {
        key: String,
        action: &'static str,
        reason: String,
    },
    #[error("{action} request to platform {key} failed")]
    CommandFailed {
        key: String,
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub struct PlatformRegistry {
    platforms: BTreeMap<String, Platform>,
    commander: Arc<dyn PlatformCommander>,
}

impl PlatformRegistry {
    pub fn new(configs: &[PlatformConfig], commander: Arc<dyn PlatformCommander>) -> Self {
        let now = Utc::now();
        let platforms = configs
            .iter()
            .map(|c| {
                (
                    c.key.clone(),
                    Platform {
                        key: c.key.clone(),
                        display_name: c.display_name.clone(),
                        state: PlatformState::Offline,
                        last_transition: now,
                        last_error: None,
                    },
                )
            })
            .collect();
        Self {
            platforms,
            commander,
        }
    }

    pub fn platform(&self, key: &str) -> Option<&Platform> {
        self.platforms.get(key)
    }

    pub fn is_online(&self, key: &str) -> bool {
        self.platforms
            .get(key)
            .map(|p| p.state == PlatformState::Online)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<Platform> {
        self.platforms.values().cloned().collect()
    }

    fn transition(&mut self, key: &str, state: PlatformState, error: Option<String>) {
        if let Some(p) = self.platforms.get_mut(key) {
            if p.state != state {
                info!(platform = %key, from = ?p.state, to = ?state, "platform transition");
            }
            p.state = state;
            p.last_transition = Utc::now();
            p.last_error = error;
        }
    }

    /// Issue a connect request to the platform's control endpoint.
    /// One round trip; the caller is never blocked beyond it.
    pub async fn connect(&mut self, key: &str) -> Result<(), RegistryError> {
        if !self.platforms.contains_key(key) {
            return Err(RegistryError::UnknownPlatform(key.to_string()));
        }
        self.transition(key, PlatformState::Connecting, None);

        match self.commander.connect(key).await {
            Ok(outcome) if outcome.success => {
                self.transition(key, PlatformState::Online, None);
                Ok(())
            }
            Ok(outcome) => {
                self.transition(key, PlatformState::Error, Some(outcome.message.clone()));
                Err(RegistryError::CommandRejected {
                    key: key.to_string(),
                    action: "connect",
                    reason: outcome.message,
                })
            }
            Err(e) => {
                self.transition(key, PlatformState::Error, Some(e.to_string()));
                Err(RegistryError::CommandFailed {
                    key: key.to_string(),
                    action: "connect",
                    source: e,
                })
            }
        }
    }

    /// Disconnect a platform. On failure the state is left as-is: we
    /// do not claim an offline we could not achieve.
    pub async fn disconnect(&mut self, key: &str) -> Result<(), RegistryError> {
        if !self.platforms.contains_key(key) {
            return Err(RegistryError::UnknownPlatform(key.to_string()));
        }

        match self.commander.disconnect(key).await {
            Ok(outcome) if outcome.success => {
                self.transition(key, PlatformState::Offline, None);
                Ok(())
            }
            Ok(outcome) => {
                warn!(platform = %key, reason = %outcome.message, "disconnect rejected, state unchanged");
                Err(RegistryError::CommandRejected {
                    key: key.to_string(),
                    action: "disconnect",
                    reason: outcome.message,
                })
            }
            Err(e) => {
                warn!(platform = %key, error = %e, "disconnect request failed, state unchanged");
                Err(RegistryError::CommandFailed {
                    key: key.to_string(),
                    action: "disconnect",
                    source: e,
                })
            }
        }
    }

    /// Disconnect every known platform sequentially, collecting all
    /// failures instead of stopping at the first.
    pub async fn disconnect_all(&mut self) -> Vec<(String, RegistryError)> {
        let keys: Vec<String> = self.platforms.keys().cloned().collect();
        let mut failures = Vec::new();
        for key in keys {
            if let Err(e) = self.disconnect(&key).await {
                failures.push((key, e));
            }
        }
        failures
    }

    /// Apply an external connectivity snapshot pushed over the
    /// channel. Returns the platforms whose state actually changed.
    pub fn apply_status_update(
        &mut self,
        snapshot: &BTreeMap<String, bool>,
    ) -> Vec<(String, PlatformState)> {
        let mut changed = Vec::new();
        for (key, connected) in snapshot {
            let Some(p) = self.platforms.get(key) else {
                warn!(platform = %key, "status update for unknown platform ignored");
                continue;
            };
            let target = if *connected {
                PlatformState::Online
            } else {
                PlatformState::Offline
            };
            if p.state != target {
                self.transition(key, target, None);
                changed.push((key.clone(), target));
            }
        }
        changed
    }
}

/// `PlatformCommander` over each platform's HTTP control endpoint.
pub struct HttpCommander {
    client: reqwest::Client,
    control_urls: BTreeMap<String, String>,
}

impl HttpCommander {
    pub fn new(configs: &[PlatformConfig]) -> Self {
        Self::with_timeout(configs, Duration::from_secs(5))
    }

    /// A hung control endpoint must surface as an error, not block the
    /// single-consumer event loop behind the registry.
    fn with_timeout(configs: &[PlatformConfig], timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            control_urls: configs
                .iter()
                .map(|c| (c.key.clone(), c.control_url.clone()))
                .collect(),
        }
    }

    async fn request(&self, key: &str, action: &str) -> anyhow::Result<CommandOutcome> {
        let base = self
            .control_urls
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no control endpoint configured for {key}"))?;
        let url = format!("{}/{}", base.trim_end_matches('/'), action);
        let response = self.client.post(&url).send().await?.error_for_status()?;
        let outcome: CommandOutcome = response.json().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl PlatformCommander for HttpCommander {
    async fn connect(&self, key: &str) -> anyhow::Result<CommandOutcome> {
        self.request(key, "connect").await
    }

    async fn disconnect(&self, key: &str) -> anyhow::Result<CommandOutcome> {
        self.request(key, "disconnect").await
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::sync::Mutex;

    /// Programmable in-memory commander for tests.
    pub struct StubCommander {
        pub reject: Mutex<Vec<String>>,
        pub fail_transport: Mutex<Vec<String>>,
    }

    impl StubCommander {
        pub fn ok() -> Arc<Self> {
            Arc::new(Self {
                reject: Mutex::new(Vec::new()),
                fail_transport: Mutex::new(Vec::new()),
            })
        }

        pub fn rejecting(keys: &[&str]) -> Arc<Self> {
            let stub = Self::ok();
            *stub.reject.lock().unwrap() = keys.iter().map(|k| k.to_string()).collect();
            stub
        }

        fn outcome(&self, key: &str) -> anyhow::Result<CommandOutcome> {
            if self.fail_transport.lock().unwrap().iter().any(|k| k == key) {
                anyhow::bail!("control endpoint unreachable");
            }
            if self.reject.lock().unwrap().iter().any(|k| k == key) {
                return Ok(CommandOutcome {
                    success: false,
                    message: format!("{key} refused the request"),
                });
            }
            Ok(CommandOutcome {
                success: true,
                message: "ok".to_string(),
            })
        }
    }

    #[async_trait]
    impl PlatformCommander for StubCommander {
        async fn connect(&self, key: &str) -> anyhow::Result<CommandOutcome> {
            self.outcome(key)
        }

        async fn disconnect(&self, key: &str) -> anyhow::Result<CommandOutcome> {
            self.outcome(key)
        }
    }
}
