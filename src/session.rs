//! Session lifecycle
//!
//! One `Session` owns one browser slot: a lazily launched process plus a
//! rotating identity context inside it. All state transitions happen behind
//! a per-session lock, so a slot never runs two challenge flows at once.
//! Teardown is best-effort and idempotent; a failed close never masks the
//! error that triggered it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::challenge::{
    execute_snippet, host_page, page_url, LIBRARY_READY, PROVIDER_HOSTS, WEBDRIVER_OVERRIDE,
};
use crate::config::PoolConfig;
use crate::driver::{BrowserContext, BrowserPage, BrowserProcess, Driver, LaunchOptions, RoutePolicy};
use crate::error::{Error, Result};
use crate::identity::{next_identity, random_window};
use crate::proxy::ProxyConfig;
use crate::warmup::pre_challenge_warmup;

struct Inner {
    process: Option<Box<dyn BrowserProcess>>,
    context: Option<Box<dyn BrowserContext>>,
    /// Challenge flows served by the current context
    context_uses: u32,
}

/// One pooled browser slot
pub struct Session {
    slot: usize,
    driver: Arc<dyn Driver>,
    config: Arc<PoolConfig>,
    inner: Mutex<Inner>,
    tokens_issued: AtomicU64,
    failures: AtomicU64,
    contexts_created: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("driver", &self.driver.name())
            .field("tokens_issued", &self.tokens_issued.load(Ordering::Relaxed))
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .field(
                "contexts_created",
                &self.contexts_created.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(slot: usize, driver: Arc<dyn Driver>, config: Arc<PoolConfig>) -> Self {
        Self {
            slot,
            driver,
            config,
            inner: Mutex::new(Inner {
                process: None,
                context: None,
                context_uses: 0,
            }),
            tokens_issued: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            contexts_created: AtomicU64::new(0),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Tokens this slot has produced over its lifetime
    pub fn tokens_issued(&self) -> u64 {
        self.tokens_issued.load(Ordering::Relaxed)
    }

    /// Failed challenge flows on this slot over its lifetime
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Identity contexts this slot has gone through
    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// Run one challenge flow and return the token.
    ///
    /// Launches the process and context on first use, rotates the context
    /// once it has served `rotation_threshold` flows, and always closes the
    /// page regardless of outcome. Errors leave the process up; the caller
    /// decides whether to tear the slot down.
    pub async fn solve(
        &self,
        project_id: &str,
        action: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;

        let result = match self.open_page(&mut inner, proxy).await {
            Ok(mut page) => {
                let result = self.run_attempt(page.as_ref(), project_id, action).await;
                if let Err(e) = page.close().await {
                    tracing::debug!(slot = self.slot, "Page close failed: {}", e);
                }
                result
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => self.tokens_issued.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Ensure process and context are up, rotating when due, and open a page
    async fn open_page(
        &self,
        inner: &mut Inner,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Box<dyn BrowserPage>> {
        let slot = self.slot;

        if inner.process.is_none() {
            let opts = LaunchOptions {
                headless: self.config.headless,
                window: random_window(),
                proxy: proxy.cloned(),
                user_data_dir: self
                    .config
                    .user_data_root
                    .as_ref()
                    .map(|root| root.join(format!("slot-{}", slot))),
            };
            tracing::info!(slot, driver = self.driver.name(), "Launching browser");
            inner.process = Some(self.driver.launch(opts).await?);
        }
        let process = inner
            .process
            .as_ref()
            .ok_or_else(|| Error::driver("session", "process vanished during setup"))?;

        if inner.context.is_some() && inner.context_uses >= self.config.rotation_threshold {
            tracing::info!(
                slot,
                uses = inner.context_uses,
                "Rotating identity context"
            );
            if let Some(mut old) = inner.context.take() {
                if let Err(e) = old.close().await {
                    tracing::debug!(slot, "Stale context close failed: {}", e);
                }
            }
            inner.context_uses = 0;
        }

        if inner.context.is_none() {
            let identity = next_identity();
            tracing::debug!(slot, user_agent = %identity.user_agent, "Creating context");
            inner.context = Some(process.new_context(&identity).await?);
            self.contexts_created.fetch_add(1, Ordering::Relaxed);
        }
        inner.context_uses += 1;

        let context = inner
            .context
            .as_ref()
            .ok_or_else(|| Error::driver("session", "context vanished during setup"))?;
        context.new_page().await
    }

    async fn run_attempt(
        &self,
        page: &dyn BrowserPage,
        project_id: &str,
        action: &str,
    ) -> Result<String> {
        page.add_init_script(WEBDRIVER_OVERRIDE).await?;
        page.install_routes(RoutePolicy {
            page_url: page_url(project_id),
            page_body: host_page(&self.config.site_key),
            allow_hosts: PROVIDER_HOSTS.iter().map(|h| h.to_string()).collect(),
        })
        .await?;

        page.goto(&page_url(project_id), self.config.nav_timeout)
            .await?;

        page.wait_for_expression(LIBRARY_READY, self.config.script_timeout)
            .await?;

        // Pointer noise between library readiness and execute; never fatal
        if self.config.warmup {
            if let Err(e) = pre_challenge_warmup(page).await {
                tracing::debug!(slot = self.slot, "Warmup interrupted: {}", e);
            }
        }

        let value = page
            .evaluate(
                &execute_snippet(&self.config.site_key, action),
                self.config.execute_timeout,
            )
            .await?;

        match value.as_str() {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(Error::Execution("challenge returned an empty token".into())),
        }
    }

    /// Navigate to the project page with real network access and read one
    /// cookie from the browsing context. Used to refresh the signed-in
    /// session token; no route filtering, so the page loads for real and
    /// the server can rotate the cookie. The page is closed on every path.
    pub async fn fetch_cookie(
        &self,
        project_id: &str,
        name: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;

        let mut page = self.open_page(&mut inner, proxy).await?;
        let result = async {
            page.goto(&page_url(project_id), self.config.nav_timeout)
                .await?;
            let cookies = page.cookies().await?;
            Ok(cookies
                .into_iter()
                .find(|cookie| cookie.name == name)
                .map(|cookie| cookie.value))
        }
        .await;

        if let Err(e) = page.close().await {
            tracing::debug!(slot = self.slot, "Page close failed: {}", e);
        }
        result
    }

    /// Tear down context and process. Idempotent; close failures are logged
    /// and swallowed so the slot always ends up released.
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(mut context) = inner.context.take() {
            if let Err(e) = context.close().await {
                tracing::debug!(slot = self.slot, "Context close failed: {}", e);
            }
        }
        if let Some(mut process) = inner.process.take() {
            if let Err(e) = process.close().await {
                tracing::warn!(slot = self.slot, "Process close failed: {}", e);
            }
            tracing::info!(slot = self.slot, "Browser closed");
        }
        inner.context_uses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StubDriver;
    use std::time::Duration;

    fn config() -> Arc<PoolConfig> {
        Arc::new(PoolConfig {
            rotation_threshold: 3,
            warmup: false,
            nav_timeout: Duration::from_millis(500),
            script_timeout: Duration::from_millis(500),
            execute_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn test_solve_produces_token_and_closes_page() {
        let driver = StubDriver::new();
        let session = Session::new(0, Arc::new(driver.clone()), config());

        let token = session.solve("proj", "IMAGE_GENERATION", None).await.unwrap();
        assert!(!token.is_empty());
        assert_eq!(session.tokens_issued(), 1);

        let log = driver.log();
        assert_eq!(log.launches.load(Ordering::Relaxed), 1);
        assert_eq!(log.pages_opened.load(Ordering::Relaxed), 1);
        assert_eq!(log.pages_closed.load(Ordering::Relaxed), 1);
        assert_eq!(log.routes_installed.load(Ordering::Relaxed), 1);
        assert_eq!(log.init_scripts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_context_rotates_at_threshold() {
        let driver = StubDriver::new();
        let session = Session::new(0, Arc::new(driver.clone()), config());

        // Threshold is 3: flows 1-3 share a context, flow 4 rotates
        for _ in 0..4 {
            session.solve("proj", "IMAGE_GENERATION", None).await.unwrap();
        }

        assert_eq!(session.contexts_created(), 2);
        assert_eq!(driver.log().context_closes.load(Ordering::Relaxed), 1);
        assert_eq!(driver.log().identities().len(), 2);
        // Process survives rotation
        assert_eq!(driver.log().launches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_runs_after_library_ready_and_before_execute() {
        let driver = StubDriver::new();
        let session = Session::new(
            0,
            Arc::new(driver.clone()),
            Arc::new(PoolConfig {
                warmup: true,
                ..(*config()).clone()
            }),
        );

        session.solve("proj", "IMAGE_GENERATION", None).await.unwrap();

        let ops = driver.log().ops();
        let ready = ops
            .iter()
            .position(|op| *op == "wait_for_expression")
            .unwrap();
        let first_move = ops.iter().position(|op| *op == "mouse_move").unwrap();
        let execute = ops.iter().position(|op| *op == "evaluate").unwrap();
        assert!(ready < first_move, "warmup must wait for the library");
        assert!(first_move < execute, "warmup must precede execution");
    }

    #[tokio::test]
    async fn test_page_closed_even_when_navigation_fails() {
        let driver = StubDriver::new();
        driver.set_fail_navigation(true);
        let session = Session::new(0, Arc::new(driver.clone()), config());

        assert!(session.solve("proj", "IMAGE_GENERATION", None).await.is_err());
        assert_eq!(session.failures(), 1);

        let log = driver.log();
        assert_eq!(log.pages_opened.load(Ordering::Relaxed), 1);
        assert_eq!(log.pages_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_force_close_is_idempotent() {
        let driver = StubDriver::new();
        let session = Session::new(0, Arc::new(driver.clone()), config());

        session.solve("proj", "IMAGE_GENERATION", None).await.unwrap();
        session.force_close().await;
        session.force_close().await;

        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 1);

        // The slot relaunches from cold on its next flow
        session.solve("proj", "IMAGE_GENERATION", None).await.unwrap();
        assert_eq!(driver.log().launches.load(Ordering::Relaxed), 2);
        assert_eq!(session.contexts_created(), 2);
    }

    #[tokio::test]
    async fn test_fetch_cookie_skips_route_interception() {
        let driver = StubDriver::new();
        driver.set_cookie("__Secure-next-auth.session-token", "fresh", ".example.com");
        let session = Session::new(0, Arc::new(driver.clone()), config());

        let value = session
            .fetch_cookie("proj", "__Secure-next-auth.session-token", None)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("fresh"));

        let log = driver.log();
        // Real navigation: no route filtering, page still closed
        assert_eq!(log.routes_installed.load(Ordering::Relaxed), 0);
        assert_eq!(log.pages_closed.load(Ordering::Relaxed), 1);

        // An absent cookie is not an error
        let missing = session.fetch_cookie("proj", "nope", None).await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces() {
        let driver = StubDriver::new();
        driver.set_fail_launches(true);
        let session = Session::new(0, Arc::new(driver.clone()), config());

        let err = session
            .solve("proj", "IMAGE_GENERATION", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
    }
}
