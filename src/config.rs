//! TOML configuration for robotbench.
//!
//! Layered model: an explicit path wins, then the `ROBOTBENCH_CONFIG`
//! environment variable, then the standard system location, then
//! compiled-in defaults covering the reference platform pair.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<PlatformConfig>,
    #[serde(default = "default_test_cases")]
    pub test_cases: Vec<TestCase>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            platforms: default_platforms(),
            test_cases: default_test_cases(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Backend channel endpoint, host:port.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Base reconnect delay; attempt N waits `base * N`.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    /// Reconnect attempts before the channel settles in Error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A platform silent for this long during a run is failed by timeout.
    #[serde(default = "default_watchdog")]
    pub watchdog_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            base_delay_secs: default_base_delay(),
            max_attempts: default_max_attempts(),
            watchdog_secs: default_watchdog(),
        }
    }
}

impl ChannelSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn watchdog(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.watchdog_secs as i64)
    }
}

fn default_endpoint() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_base_delay() -> u64 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_watchdog() -> u64 {
    60
}

/// One robot-control target, physical or simulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub key: String,
    pub display_name: String,
    /// Per-platform connect/disconnect control endpoint, reached
    /// outside the persistent channel.
    pub control_url: String,
}

/// An immutable test definition, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub name: String,
    pub commands: Vec<String>,
}

fn default_platforms() -> Vec<PlatformConfig> {
    vec![
        PlatformConfig {
            key: "real_robot".to_string(),
            display_name: "BRUCE robot".to_string(),
            control_url: "http://127.0.0.1:9301".to_string(),
        },
        PlatformConfig {
            key: "gazebo".to_string(),
            display_name: "Gazebo simulation".to_string(),
            control_url: "http://127.0.0.1:9302".to_string(),
        },
    ]
}

fn default_test_cases() -> Vec<TestCase> {
    vec![TestCase {
        key: "walk_forward".to_string(),
        name: "Walk forward".to_string(),
        description: "Basic forward gait over flat ground".to_string(),
        steps: vec![
            TestStep {
                name: "stand".to_string(),
                commands: vec!["gait stand".to_string()],
            },
            TestStep {
                name: "walk".to_string(),
                commands: vec!["gait walk --distance 2.0".to_string()],
            },
        ],
        parameters: BTreeMap::from([(
            "distance_m".to_string(),
            serde_json::Value::from(2.0),
        )]),
    }]
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `ROBOTBENCH_CONFIG` environment variable.
    /// 2. `/etc/robotbench/robotbench.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("ROBOTBENCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ROBOTBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/robotbench/robotbench.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(error = %e, "system config unreadable, using defaults");
                }
            }
        }

        Self::default()
    }

    pub fn test_case(&self, key: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|c| c.key == key)
    }

    pub fn platform(&self, key: &str) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_reference_platforms() {
        let cfg = Config::default();
        assert!(cfg.platform("real_robot").is_some());
        assert!(cfg.platform("gazebo").is_some());
        assert_eq!(cfg.channel.base_delay_secs, 3);
        assert_eq!(cfg.channel.max_attempts, 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [channel]
            endpoint = "10.0.0.5:9300"

            [[platforms]]
            key = "mujoco"
            display_name = "MuJoCo"
            control_url = "http://10.0.0.6:9301"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.channel.endpoint, "10.0.0.5:9300");
        assert_eq!(cfg.channel.max_attempts, 5);
        assert_eq!(cfg.platforms.len(), 1);
        assert_eq!(cfg.platforms[0].key, "mujoco");
        // Unspecified test cases fall back to the built-in set.
        assert!(cfg.test_case("walk_forward").is_some());
    }
}
