//! Token acquisition service
//!
//! The outward face of the crate: checks the environment can run a browser
//! at all, then drives checkout, the bounded retry loop, and slot recovery.
//! A failed attempt always tears the slot's browser down before the next
//! one, so retries never reuse a wedged process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{ConfigSource, PoolConfig};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::pool::{SessionPool, StatsSnapshot};

/// Result of one acquisition. `token` is None when every attempt failed
/// and the retry budget ran out; infrastructure problems surface as errors
/// instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub token: Option<String>,
    /// Slot that served (or failed) the acquisition, for invalid reports
    pub slot: usize,
}

/// Pooled token acquisition front end
pub struct TokenService {
    pool: Arc<SessionPool>,
    capability: OnceCell<bool>,
}

impl TokenService {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: PoolConfig,
        source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            pool: Arc::new(SessionPool::new(driver, Arc::new(config), source)),
            capability: OnceCell::new(),
        }
    }

    /// Probe the backend once per service lifetime
    async fn check_capability(&self) -> Result<()> {
        let available = *self
            .capability
            .get_or_init(|| async {
                let available = self.pool.driver().available();
                if !available {
                    tracing::error!(
                        driver = self.pool.driver().name(),
                        "Automation backend unavailable"
                    );
                }
                available
            })
            .await;

        if available {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "driver '{}' cannot run in this environment",
                self.pool.driver().name()
            )))
        }
    }

    /// Obtain one token for the given project page and action.
    ///
    /// Waits for an admission permit, then runs up to `max_attempts`
    /// challenge flows on the checked-out slot. Every failed attempt closes
    /// the slot's browser and pauses `retry_backoff` before the next try.
    pub async fn acquire_token(&self, project_id: &str, action: &str) -> Result<Acquisition> {
        self.check_capability().await?;

        let (session, _permit) = self.pool.checkout().await?;
        let slot = session.slot();
        let config = Arc::clone(self.pool.config());
        let proxy = self.pool.proxy().await;

        for attempt in 1..=config.max_attempts {
            match session.solve(project_id, action, proxy.as_ref()).await {
                Ok(token) => {
                    self.pool
                        .stats()
                        .tokens_issued
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::info!(slot, attempt, "Token acquired");
                    return Ok(Acquisition {
                        token: Some(token),
                        slot,
                    });
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    self.pool
                        .stats()
                        .attempt_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(slot, attempt, "Attempt failed: {}", e);

                    // A fresh browser for the next attempt
                    session.force_close().await;

                    if attempt < config.max_attempts {
                        tokio::time::sleep(config.retry_backoff).await;
                    }
                }
            }
        }

        tracing::error!(slot, attempts = config.max_attempts, "Retry budget exhausted");
        Ok(Acquisition { token: None, slot })
    }

    /// Reload the signed-in session token by visiting the project page with
    /// real network access and reading the auth cookie. Returns None when
    /// the browser holds no such cookie (not signed in, or it expired).
    /// Transient failures tear the slot's browser down like any other.
    pub async fn refresh_session_token(&self, project_id: &str) -> Result<Option<String>> {
        self.check_capability().await?;

        let (session, _permit) = self.pool.checkout().await?;
        let slot = session.slot();
        let proxy = self.pool.proxy().await;

        match session
            .fetch_cookie(project_id, crate::challenge::SESSION_COOKIE, proxy.as_ref())
            .await
        {
            Ok(Some(value)) => {
                tracing::info!(slot, "Session token refreshed");
                Ok(Some(value))
            }
            Ok(None) => {
                tracing::warn!(slot, "No session token cookie present");
                Ok(None)
            }
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => {
                tracing::warn!(slot, "Session token refresh failed: {}", e);
                session.force_close().await;
                Err(e)
            }
        }
    }

    /// Report that a previously issued token was rejected downstream.
    /// Returns true when the report retired the slot's session.
    pub async fn report_invalid(&self, slot: usize) -> bool {
        tracing::warn!(slot, "Token reported invalid");
        self.pool.record_invalid(slot).await
    }

    /// Re-read capacity and proxy settings from the config source
    pub async fn reload_capacity(&self) -> Result<usize> {
        self.pool.reload_capacity().await
    }

    /// Retire one slot's session immediately
    pub async fn remove_session(&self, slot: usize) -> bool {
        self.pool.remove_session(slot).await
    }

    /// Close every browser and refuse further acquisitions
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.pool.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, StaticSource};
    use crate::driver::stub::StubOutcome;
    use crate::driver::StubDriver;
    use std::time::Duration;

    fn service(driver: StubDriver, capacity: usize) -> TokenService {
        let config = PoolConfig {
            warmup: false,
            retry_backoff: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let source = StaticSource::new(PoolSettings {
            capacity,
            proxy_enabled: false,
            proxy_url: None,
        });
        TokenService::new(Arc::new(driver), config, Arc::new(source))
    }

    #[tokio::test]
    async fn test_acquire_happy_path() {
        let driver = StubDriver::new();
        let svc = service(driver.clone(), 1);

        let acq = svc.acquire_token("proj", "IMAGE_GENERATION").await.unwrap();
        assert!(acq.token.is_some());
        assert_eq!(acq.slot, 0);
        assert_eq!(svc.stats().await.tokens_issued, 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_fast() {
        let driver = StubDriver::new();
        driver.set_available(false);
        let svc = service(driver.clone(), 1);

        let err = svc.acquire_token("proj", "a").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        // No browser activity at all
        assert_eq!(driver.log().launches.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let driver = StubDriver::new();
        driver.push_outcome(StubOutcome::ExecuteTimeout);
        let svc = service(driver.clone(), 1);

        let acq = svc.acquire_token("proj", "a").await.unwrap();
        assert!(acq.token.is_some());

        // First attempt failed and tore the browser down, second relaunched
        assert_eq!(driver.log().launches.load(Ordering::Relaxed), 2);
        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 1);
        assert_eq!(svc.stats().await.attempt_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_session_token_reads_auth_cookie() {
        let driver = StubDriver::new();
        driver.set_cookie(
            crate::challenge::SESSION_COOKIE,
            "refreshed-value",
            ".example.com",
        );
        let svc = service(driver.clone(), 1);

        let token = svc.refresh_session_token("proj").await.unwrap();
        assert_eq!(token.as_deref(), Some("refreshed-value"));

        // Real page load, no route interception, cookies read afterwards
        assert_eq!(driver.log().routes_installed.load(Ordering::Relaxed), 0);
        assert_eq!(driver.log().ops(), vec!["goto", "cookies"]);
    }

    #[tokio::test]
    async fn test_refresh_without_cookie_yields_none() {
        let driver = StubDriver::new();
        let svc = service(driver.clone(), 1);

        let token = svc.refresh_session_token("proj").await.unwrap();
        assert_eq!(token, None);
        // The page still gets closed
        assert_eq!(driver.log().pages_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_no_token() {
        let driver = StubDriver::new();
        driver.set_default_outcome(StubOutcome::ExecuteRejected("provider said no".into()));
        let svc = service(driver.clone(), 1);

        let acq = svc.acquire_token("proj", "a").await.unwrap();
        assert_eq!(acq.token, None);

        // Three attempts, each with its own launch and teardown
        assert_eq!(driver.log().launches.load(Ordering::Relaxed), 3);
        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 3);
        assert_eq!(svc.stats().await.attempt_failures, 3);
    }
}
