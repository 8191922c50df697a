//! Chrome DevTools Protocol backend
//!
//! Drives a real Chrome/Chromium process over its DevTools WebSocket.
//! Contexts map to `Target.createBrowserContext` so each one carries its own
//! cookie jar and cache; identity stamping uses the Network and Emulation
//! domains on a per-page session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::identity::{Identity, Viewport};

use super::{BrowserContext, BrowserPage, BrowserProcess, Driver, LaunchOptions, RouteAction, RoutePolicy};

pub mod transport;

use transport::Transport;

static PROFILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Locate a Chrome/Chromium binary
pub fn find_chrome() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("CHROME_PATH") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    #[cfg(target_os = "linux")]
    let candidates: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
    ];

    #[cfg(target_os = "macos")]
    let candidates: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    #[cfg(target_os = "windows")]
    let candidates: &[&str] = &[
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];

    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    // Fall back to a PATH search
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
                let path = dir.join(name);
                if path.is_file() {
                    return Ok(path);
                }
            }
        }
    }

    Err(Error::Unavailable("No Chrome/Chromium binary found".into()))
}

/// Launch flags that suppress automation tells
fn stealth_args(opts: &LaunchOptions, user_data_dir: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-infobars".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-component-update".to_string(),
        "--disable-sync".to_string(),
        "--disable-breakpad".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-service-autorun".to_string(),
        "--password-store=basic".to_string(),
        "--lang=en-US".to_string(),
        format!("--window-size={},{}", opts.window.0, opts.window.1),
        format!("--user-data-dir={}", user_data_dir.display()),
    ];

    if opts.headless {
        args.push("--headless=new".to_string());
    }

    if let Some(proxy) = &opts.proxy {
        args.push(format!("--proxy-server={}", proxy.server));
    }

    args
}

/// The production DevTools-protocol driver
#[derive(Debug, Default, Clone, Copy)]
pub struct CdpDriver;

impl CdpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for CdpDriver {
    fn name(&self) -> &'static str {
        "cdp"
    }

    fn available(&self) -> bool {
        super::display_available() && find_chrome().is_ok()
    }

    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserProcess>> {
        let chrome = find_chrome()?;

        let (user_data_dir, ephemeral) = match &opts.user_data_dir {
            Some(dir) => (dir.clone(), false),
            None => {
                let n = PROFILE_COUNTER.fetch_add(1, Ordering::SeqCst);
                let dir = std::env::temp_dir().join(format!(
                    "captok-profile-{}-{}",
                    std::process::id(),
                    n
                ));
                (dir, true)
            }
        };
        std::fs::create_dir_all(&user_data_dir)?;

        let args = stealth_args(&opts, &user_data_dir);
        tracing::info!("Launching browser: {}", chrome.display());

        let (child, ws_url) = transport::launch_browser(&chrome, &args).await?;
        let transport = Transport::connect(child, &ws_url).await?;

        let credentials = opts.proxy.as_ref().and_then(|p| {
            match (&p.username, &p.password) {
                (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
                _ => None,
            }
        });

        Ok(Box::new(CdpProcess {
            transport: Arc::new(transport),
            user_data_dir,
            ephemeral,
            credentials,
            closed: false,
        }))
    }
}

/// One running Chrome process
pub struct CdpProcess {
    transport: Arc<Transport>,
    user_data_dir: PathBuf,
    ephemeral: bool,
    credentials: Option<(String, String)>,
    closed: bool,
}

#[async_trait]
impl BrowserProcess for CdpProcess {
    async fn new_context(&self, identity: &Identity) -> Result<Box<dyn BrowserContext>> {
        let result = self
            .transport
            .send("Target.createBrowserContext", json!({ "disposeOnDetach": true }))
            .await?;
        let context_id = result
            .get("browserContextId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::driver("Target.createBrowserContext", "no browserContextId"))?
            .to_string();

        tracing::debug!("Created browser context {}", context_id);

        Ok(Box::new(CdpContext {
            transport: Arc::clone(&self.transport),
            context_id,
            identity: identity.clone(),
            credentials: self.credentials.clone(),
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.transport.send("Browser.close", json!({})).await {
            tracing::debug!("Browser.close failed: {}", e);
        }
        self.transport.close().await;

        if self.ephemeral {
            if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
                tracing::debug!("Failed to remove profile dir: {}", e);
            }
        }

        Ok(())
    }
}

/// An isolated browsing context inside a Chrome process
pub struct CdpContext {
    transport: Arc<Transport>,
    context_id: String,
    identity: Identity,
    credentials: Option<(String, String)>,
    closed: bool,
}

#[async_trait]
impl BrowserContext for CdpContext {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        let result = self
            .transport
            .send(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": self.context_id }),
            )
            .await?;
        let target_id = result
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::driver("Target.createTarget", "no targetId"))?
            .to_string();

        let result = self
            .transport
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::driver("Target.attachToTarget", "no sessionId"))?
            .to_string();

        self.transport
            .send_to_session(&session_id, "Page.enable", json!({}))
            .await?;
        self.transport
            .send_to_session(
                &session_id,
                "Network.setUserAgentOverride",
                json!({ "userAgent": self.identity.user_agent }),
            )
            .await?;
        self.transport
            .send_to_session(
                &session_id,
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": self.identity.viewport.width,
                    "height": self.identity.viewport.height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )
            .await?;

        Ok(Box::new(CdpPage {
            transport: Arc::clone(&self.transport),
            session_id,
            target_id,
            viewport: self.identity.viewport,
            credentials: self.credentials.clone(),
            route_task: StdMutex::new(None),
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.transport
            .send(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
            )
            .await?;
        Ok(())
    }
}

/// One attached page session
pub struct CdpPage {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
    viewport: Viewport,
    credentials: Option<(String, String)>,
    route_task: StdMutex<Option<JoinHandle<()>>>,
    closed: bool,
}

impl CdpPage {
    /// Synchronous evaluation without promise handling
    async fn eval_sync(&self, expression: &str) -> Result<Value> {
        let result = self
            .transport
            .send_to_session(
                &self.session_id,
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BrowserPage for CdpPage {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn add_init_script(&self, source: &str) -> Result<()> {
        self.transport
            .send_to_session(
                &self.session_id,
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": source }),
            )
            .await?;
        Ok(())
    }

    async fn install_routes(&self, policy: RoutePolicy) -> Result<()> {
        // Subscribe before enabling so no pause event is lost
        let mut events = self.transport.subscribe(&self.session_id);

        self.transport
            .send_to_session(
                &self.session_id,
                "Fetch.enable",
                json!({
                    "patterns": [{ "urlPattern": "*" }],
                    "handleAuthRequests": self.credentials.is_some(),
                }),
            )
            .await?;

        let transport = Arc::clone(&self.transport);
        let session_id = self.session_id.clone();
        let credentials = self.credentials.clone();
        let body_b64 = base64::engine::general_purpose::STANDARD.encode(&policy.page_body);

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event.method.as_str() {
                    "Fetch.requestPaused" => {
                        let request_id = match event.params.get("requestId").and_then(Value::as_str)
                        {
                            Some(id) => id.to_string(),
                            None => continue,
                        };
                        let url = event
                            .params
                            .pointer("/request/url")
                            .and_then(Value::as_str)
                            .unwrap_or("");

                        let outcome = match policy.decide(url) {
                            RouteAction::Fulfill => {
                                tracing::debug!("Serving synthetic page for {}", url);
                                transport
                                    .send_to_session(
                                        &session_id,
                                        "Fetch.fulfillRequest",
                                        json!({
                                            "requestId": request_id,
                                            "responseCode": 200,
                                            "responseHeaders": [
                                                { "name": "Content-Type", "value": "text/html; charset=utf-8" },
                                            ],
                                            "body": body_b64,
                                        }),
                                    )
                                    .await
                            }
                            RouteAction::Continue => {
                                transport
                                    .send_to_session(
                                        &session_id,
                                        "Fetch.continueRequest",
                                        json!({ "requestId": request_id }),
                                    )
                                    .await
                            }
                            RouteAction::Abort => {
                                tracing::trace!("Aborting request to {}", url);
                                transport
                                    .send_to_session(
                                        &session_id,
                                        "Fetch.failRequest",
                                        json!({
                                            "requestId": request_id,
                                            "errorReason": "BlockedByClient",
                                        }),
                                    )
                                    .await
                            }
                        };
                        if let Err(e) = outcome {
                            tracing::debug!("Route answer failed: {}", e);
                        }
                    }
                    "Fetch.authRequired" => {
                        let request_id = event
                            .params
                            .get("requestId")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let auth = match &credentials {
                            Some((user, pass)) => json!({
                                "response": "ProvideCredentials",
                                "username": user,
                                "password": pass,
                            }),
                            None => json!({ "response": "CancelAuth" }),
                        };
                        let result = transport
                            .send_to_session(
                                &session_id,
                                "Fetch.continueWithAuth",
                                json!({ "requestId": request_id, "authChallengeResponse": auth }),
                            )
                            .await;
                        if let Err(e) = result {
                            tracing::debug!("Auth answer failed: {}", e);
                        }
                    }
                    _ => {}
                }
            }
        });

        *self.route_task.lock().expect("route task lock") = Some(task);
        Ok(())
    }

    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        let navigate = self.transport.send_to_session(
            &self.session_id,
            "Page.navigate",
            json!({ "url": url }),
        );
        let result = tokio::time::timeout(timeout, navigate)
            .await
            .map_err(|_| Error::Timeout(format!("Navigation to {} timed out", url)))??;

        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            if !error.is_empty() {
                return Err(Error::Navigation(format!("{}: {}", url, error)));
            }
        }

        // Wait for the document to settle
        self.wait_for_expression("document.readyState === 'complete'", timeout)
            .await
            .map_err(|_| Error::Navigation(format!("{}: page never finished loading", url)))
    }

    async fn wait_for_expression(&self, expression: &str, timeout: Duration) -> Result<()> {
        let probe = format!("!!({})", expression);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.eval_sync(&probe).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "Expression never became truthy: {}",
                    expression
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value> {
        let eval = self.transport.send_to_session(
            &self.session_id,
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        );
        let result = tokio::time::timeout(timeout, eval)
            .await
            .map_err(|_| Error::Timeout("Evaluation timed out".into()))??;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.pointer("/text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            return Err(Error::Execution(text.to_string()));
        }

        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn cookies(&self) -> Result<Vec<super::Cookie>> {
        let result = self
            .transport
            .send_to_session(&self.session_id, "Network.getCookies", json!({}))
            .await?;

        let mut cookies = Vec::new();
        if let Some(list) = result.get("cookies").and_then(Value::as_array) {
            for entry in list {
                let field = |key: &str| {
                    entry
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                cookies.push(super::Cookie {
                    name: field("name"),
                    value: field("value"),
                    domain: field("domain"),
                });
            }
        }
        Ok(cookies)
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.transport
            .send_to_session(
                &self.session_id,
                "Input.dispatchMouseEvent",
                json!({ "type": "mouseMoved", "x": x, "y": y }),
            )
            .await?;
        Ok(())
    }

    async fn scroll(&self, delta_y: f64) -> Result<()> {
        // Wheel events need pointer coordinates; the viewport center works
        self.transport
            .send_to_session(
                &self.session_id,
                "Input.dispatchMouseEvent",
                json!({
                    "type": "mouseWheel",
                    "x": self.viewport.width as f64 / 2.0,
                    "y": self.viewport.height as f64 / 2.0,
                    "deltaX": 0.0,
                    "deltaY": delta_y,
                }),
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let task = self.route_task.lock().expect("route task lock").take();
        self.transport.unsubscribe(&self.session_id);
        if let Some(task) = task {
            task.abort();
        }

        self.transport
            .send("Target.closeTarget", json!({ "targetId": self.target_id }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyConfig;

    #[test]
    fn test_stealth_args_include_window_and_profile() {
        let opts = LaunchOptions {
            headless: false,
            window: (1512, 899),
            proxy: None,
            user_data_dir: None,
        };
        let args = stealth_args(&opts, std::path::Path::new("/tmp/profile"));
        assert!(args.contains(&"--window-size=1512,899".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn test_stealth_args_headless_and_proxy() {
        let opts = LaunchOptions {
            headless: true,
            window: (1280, 720),
            proxy: Some(ProxyConfig {
                server: "http://1.2.3.4:8080".into(),
                username: None,
                password: None,
            }),
            user_data_dir: None,
        };
        let args = stealth_args(&opts, std::path::Path::new("/tmp/p"));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=http://1.2.3.4:8080".to_string()));
    }
}
