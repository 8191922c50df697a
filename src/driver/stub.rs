//! In-memory scripted driver
//!
//! A second implementation of the driver interface that runs entirely in
//! memory: no browser, no network. Outcomes are scripted per evaluate call
//! and every lifecycle step is recorded, which is what the pool and retry
//! state-machine tests run against.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::driver::{
    BrowserContext, BrowserPage, Cookie, Driver, LaunchOptions, RoutePolicy,
};
use crate::error::{Error, Result};
use crate::identity::{Identity, Viewport};

/// Scripted result of one challenge-execute evaluation
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Resolve with this token
    Token(String),
    /// The execute call times out
    ExecuteTimeout,
    /// The evaluation rejects with a provider error
    ExecuteRejected(String),
}

/// Recorded lifecycle events, shared across all handles of one driver
#[derive(Debug, Default)]
pub struct StubLog {
    pub launches: AtomicUsize,
    pub process_closes: AtomicUsize,
    pub context_closes: AtomicUsize,
    pub pages_opened: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub routes_installed: AtomicUsize,
    pub init_scripts: AtomicUsize,
    /// Identity stamped onto each created context, in creation order
    pub identities: Mutex<Vec<Identity>>,
    /// Page operations in call order
    pub ops: Mutex<Vec<&'static str>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubLog {
    pub fn identities(&self) -> Vec<Identity> {
        self.identities.lock().expect("stub log lock").clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().expect("stub log lock").clone()
    }

    fn record(&self, op: &'static str) {
        self.ops.lock().expect("stub log lock").push(op);
    }
}

struct StubShared {
    log: StubLog,
    outcomes: Mutex<VecDeque<StubOutcome>>,
    default_outcome: Mutex<StubOutcome>,
    token_seq: AtomicUsize,
    available: AtomicBool,
    fail_launches: AtomicBool,
    fail_navigation: AtomicBool,
    evaluate_delay: Mutex<Duration>,
    cookies: Mutex<Vec<Cookie>>,
}

/// The scripted in-memory driver
#[derive(Clone)]
pub struct StubDriver {
    shared: Arc<StubShared>,
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StubDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StubShared {
                log: StubLog::default(),
                outcomes: Mutex::new(VecDeque::new()),
                default_outcome: Mutex::new(StubOutcome::Token(String::new())),
                token_seq: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                fail_launches: AtomicBool::new(false),
                fail_navigation: AtomicBool::new(false),
                evaluate_delay: Mutex::new(Duration::from_millis(10)),
                cookies: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn log(&self) -> &StubLog {
        &self.shared.log
    }

    /// Queue an outcome for the next evaluate call
    pub fn push_outcome(&self, outcome: StubOutcome) {
        self.shared
            .outcomes
            .lock()
            .expect("stub outcomes lock")
            .push_back(outcome);
    }

    /// Outcome used whenever the queue is empty. The default resolves with a
    /// sequential `stub-token-N`.
    pub fn set_default_outcome(&self, outcome: StubOutcome) {
        *self
            .shared
            .default_outcome
            .lock()
            .expect("stub outcomes lock") = outcome;
    }

    /// Flip the capability probe
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Relaxed);
    }

    /// Make every launch fail
    pub fn set_fail_launches(&self, fail: bool) {
        self.shared.fail_launches.store(fail, Ordering::Relaxed);
    }

    /// Make every navigation fail
    pub fn set_fail_navigation(&self, fail: bool) {
        self.shared.fail_navigation.store(fail, Ordering::Relaxed);
    }

    /// Seed a cookie visible to every page
    pub fn set_cookie(&self, name: &str, value: &str, domain: &str) {
        self.shared
            .cookies
            .lock()
            .expect("stub cookies lock")
            .push(Cookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: domain.to_string(),
            });
    }

    /// Time each evaluate call spends "executing" (drives concurrency tests)
    pub fn set_evaluate_delay(&self, delay: Duration) {
        *self
            .shared
            .evaluate_delay
            .lock()
            .expect("stub outcomes lock") = delay;
    }

    fn next_outcome(shared: &StubShared) -> StubOutcome {
        let queued = shared
            .outcomes
            .lock()
            .expect("stub outcomes lock")
            .pop_front();
        match queued {
            Some(outcome) => outcome,
            None => {
                let default = shared
                    .default_outcome
                    .lock()
                    .expect("stub outcomes lock")
                    .clone();
                match default {
                    StubOutcome::Token(ref s) if s.is_empty() => {
                        let n = shared.token_seq.fetch_add(1, Ordering::Relaxed);
                        StubOutcome::Token(format!("stub-token-{}", n))
                    }
                    other => other,
                }
            }
        }
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn available(&self) -> bool {
        self.shared.available.load(Ordering::Relaxed)
    }

    async fn launch(&self, _opts: LaunchOptions) -> Result<Box<dyn super::BrowserProcess>> {
        if self.shared.fail_launches.load(Ordering::Relaxed) {
            return Err(Error::Launch("scripted launch failure".into()));
        }
        self.shared.log.launches.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubProcess {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct StubProcess {
    shared: Arc<StubShared>,
}

#[async_trait]
impl super::BrowserProcess for StubProcess {
    async fn new_context(&self, identity: &Identity) -> Result<Box<dyn BrowserContext>> {
        self.shared
            .log
            .identities
            .lock()
            .expect("stub log lock")
            .push(identity.clone());
        Ok(Box::new(StubContext {
            shared: Arc::clone(&self.shared),
            identity: identity.clone(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.shared
            .log
            .process_closes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct StubContext {
    shared: Arc<StubShared>,
    identity: Identity,
}

#[async_trait]
impl BrowserContext for StubContext {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        self.shared.log.pages_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubPage {
            shared: Arc::clone(&self.shared),
            viewport: self.identity.viewport,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.shared
            .log
            .context_closes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct StubPage {
    shared: Arc<StubShared>,
    viewport: Viewport,
}

#[async_trait]
impl BrowserPage for StubPage {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn add_init_script(&self, _source: &str) -> Result<()> {
        self.shared.log.init_scripts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn install_routes(&self, _policy: RoutePolicy) -> Result<()> {
        self.shared
            .log
            .routes_installed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.shared.log.record("goto");
        if self.shared.fail_navigation.load(Ordering::Relaxed) {
            return Err(Error::Navigation(format!("scripted failure for {}", url)));
        }
        Ok(())
    }

    async fn wait_for_expression(&self, _expression: &str, _timeout: Duration) -> Result<()> {
        self.shared.log.record("wait_for_expression");
        Ok(())
    }

    async fn evaluate(&self, _expression: &str, _timeout: Duration) -> Result<Value> {
        self.shared.log.record("evaluate");
        let delay = *self
            .shared
            .evaluate_delay
            .lock()
            .expect("stub outcomes lock");

        let in_flight = self.shared.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .log
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        tokio::time::sleep(delay).await;

        self.shared.log.in_flight.fetch_sub(1, Ordering::SeqCst);

        match StubDriver::next_outcome(&self.shared) {
            StubOutcome::Token(token) => Ok(json!(token)),
            StubOutcome::ExecuteTimeout => {
                Err(Error::Timeout("scripted execute timeout".into()))
            }
            StubOutcome::ExecuteRejected(msg) => Err(Error::Execution(msg)),
        }
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        self.shared.log.record("cookies");
        Ok(self.shared.cookies.lock().expect("stub cookies lock").clone())
    }

    async fn mouse_move(&self, _x: f64, _y: f64) -> Result<()> {
        self.shared.log.record("mouse_move");
        Ok(())
    }

    async fn scroll(&self, _delta_y: f64) -> Result<()> {
        self.shared.log.record("scroll");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.log.pages_closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::next_identity;

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let driver = StubDriver::new();
        driver.push_outcome(StubOutcome::ExecuteTimeout);
        driver.push_outcome(StubOutcome::Token("t2".into()));
        driver.set_evaluate_delay(Duration::ZERO);

        let process = driver.launch(LaunchOptions::default()).await.unwrap();
        let ctx = process.new_context(&next_identity()).await.unwrap();
        let page = ctx.new_page().await.unwrap();

        assert!(matches!(
            page.evaluate("x", Duration::from_secs(1)).await,
            Err(Error::Timeout(_))
        ));
        let token = page.evaluate("x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(token, json!("t2"));

        // Queue drained, sequential default takes over
        let token = page.evaluate("x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(token, json!("stub-token-0"));
    }

    #[tokio::test]
    async fn test_lifecycle_is_recorded() {
        let driver = StubDriver::new();
        let mut process = driver.launch(LaunchOptions::default()).await.unwrap();
        let mut ctx = process.new_context(&next_identity()).await.unwrap();
        let mut page = ctx.new_page().await.unwrap();
        page.close().await.unwrap();
        ctx.close().await.unwrap();
        process.close().await.unwrap();

        let log = driver.log();
        assert_eq!(log.launches.load(Ordering::Relaxed), 1);
        assert_eq!(log.pages_opened.load(Ordering::Relaxed), 1);
        assert_eq!(log.pages_closed.load(Ordering::Relaxed), 1);
        assert_eq!(log.context_closes.load(Ordering::Relaxed), 1);
        assert_eq!(log.process_closes.load(Ordering::Relaxed), 1);
        assert_eq!(log.identities().len(), 1);
    }
}
