//! Pool configuration
//!
//! Two layers: `PoolConfig` is fixed at construction (tunables and provider
//! contract), `PoolSettings` is re-read from a `ConfigSource` at creation and
//! on explicit reload.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::challenge::DEFAULT_SITE_KEY;
use crate::error::Result;

/// Construction-time tunables
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// reCAPTCHA Enterprise site key for the protected resource
    pub site_key: String,
    /// Context acquisitions before the identity context is rotated
    pub rotation_threshold: u32,
    /// Challenge-solve attempts per acquisition
    pub max_attempts: u32,
    /// Fixed pause between failed attempts
    pub retry_backoff: Duration,
    /// Page navigation timeout
    pub nav_timeout: Duration,
    /// Wait for the challenge library global to become defined
    pub script_timeout: Duration,
    /// Outer bound on the challenge execute call
    pub execute_timeout: Duration,
    /// Headless browser mode
    pub headless: bool,
    /// Run the pointer warm-up gesture sequence before each challenge
    pub warmup: bool,
    /// Invalid reports against one slot before its session is force-closed.
    /// `None` keeps reports as statistics only.
    pub invalid_report_threshold: Option<u32>,
    /// Root directory for per-slot browser profiles (None = temp dir)
    pub user_data_root: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            site_key: DEFAULT_SITE_KEY.to_string(),
            rotation_threshold: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            nav_timeout: Duration::from_secs(30),
            script_timeout: Duration::from_secs(15),
            execute_timeout: Duration::from_secs(30),
            headless: false,
            warmup: true,
            invalid_report_threshold: None,
            user_data_root: None,
        }
    }
}

/// Runtime-reloadable settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Pool capacity == admission permits (clamped to at least 1)
    pub capacity: usize,
    /// Whether the configured proxy is applied to launched browsers
    pub proxy_enabled: bool,
    /// Raw proxy URL, `[scheme://][user:pass@]host:port`
    pub proxy_url: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            proxy_enabled: false,
            proxy_url: None,
        }
    }
}

impl PoolSettings {
    /// Capacity with the minimum of 1 enforced
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(1)
    }
}

/// External persistent-configuration collaborator
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<PoolSettings>;
}

/// In-memory settings source, mutable for hot-reload scenarios
pub struct StaticSource {
    settings: RwLock<PoolSettings>,
}

impl StaticSource {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replace the stored settings; takes effect on the next reload
    pub fn set(&self, settings: PoolSettings) {
        *self.settings.write().expect("settings lock poisoned") = settings;
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

#[async_trait]
impl ConfigSource for StaticSource {
    async fn load(&self) -> Result<PoolSettings> {
        Ok(self.settings.read().expect("settings lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_round_trip() {
        let source = StaticSource::default();
        assert_eq!(source.load().await.unwrap().capacity, 1);

        source.set(PoolSettings {
            capacity: 4,
            proxy_enabled: true,
            proxy_url: Some("1.2.3.4:8080".into()),
        });
        let settings = source.load().await.unwrap();
        assert_eq!(settings.capacity, 4);
        assert!(settings.proxy_enabled);
    }

    #[test]
    fn test_capacity_floor() {
        let settings = PoolSettings {
            capacity: 0,
            ..Default::default()
        };
        assert_eq!(settings.effective_capacity(), 1);
    }
}
