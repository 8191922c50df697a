//! Automated-session capability interface
//!
//! The pool and session lifecycle are written once against these traits; the
//! CDP backend and the in-memory stub are interchangeable behind them. The
//! trait surface is the minimum the challenge flow consumes: launch, context
//! creation, page routing/navigation/evaluation, pointer input, teardown.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::identity::{Identity, Viewport};
use crate::proxy::ProxyConfig;

pub mod cdp;
pub mod stub;

pub use cdp::CdpDriver;
pub use stub::StubDriver;

/// Options for launching one browser process
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Outer window size (width, height)
    pub window: (u32, u32),
    pub proxy: Option<ProxyConfig>,
    /// Persistent profile directory; None means a throwaway temp dir
    pub user_data_dir: Option<PathBuf>,
}

/// Request-routing rule installed on a page before navigation.
///
/// The canonical page URL is answered with the synthetic body, requests to
/// the allowed hosts pass through, everything else is aborted.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub page_url: String,
    pub page_body: String,
    pub allow_hosts: Vec<String>,
}

impl RoutePolicy {
    /// Decide what to do with a request URL
    pub fn decide(&self, url: &str) -> RouteAction {
        if url.trim_end_matches('/') == self.page_url.trim_end_matches('/') {
            RouteAction::Fulfill
        } else if self.allow_hosts.iter().any(|host| url.contains(host.as_str())) {
            RouteAction::Continue
        } else {
            RouteAction::Abort
        }
    }
}

/// One cookie as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Outcome of a route decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Serve the synthetic page body
    Fulfill,
    /// Let the request through to the network
    Continue,
    /// Abort the request
    Abort,
}

/// An automation backend capable of launching browser processes
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Startup-time capability probe: can this backend run here at all?
    /// Consulted before any admission; a false answer is a permanent failure.
    fn available(&self) -> bool;

    async fn launch(&self, opts: LaunchOptions) -> Result<Box<dyn BrowserProcess>>;
}

/// One running browser process
#[async_trait]
pub trait BrowserProcess: Send + Sync {
    /// Create an isolated browsing context stamped with the given identity
    async fn new_context(&self, identity: &Identity) -> Result<Box<dyn BrowserContext>>;

    async fn close(&mut self) -> Result<()>;
}

/// An isolated browsing identity within a process
#[async_trait]
pub trait BrowserContext: Send + Sync {
    fn identity(&self) -> &Identity;

    async fn new_page(&self) -> Result<Box<dyn BrowserPage>>;

    async fn close(&mut self) -> Result<()>;
}

/// One open page
#[async_trait]
pub trait BrowserPage: Send + Sync {
    fn viewport(&self) -> Viewport;

    /// Install a script evaluated before any page script on new documents
    async fn add_init_script(&self, source: &str) -> Result<()>;

    /// Install the request-routing rule; must be called before `goto`
    async fn install_routes(&self, policy: RoutePolicy) -> Result<()>;

    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Poll until the expression evaluates truthy
    async fn wait_for_expression(&self, expression: &str, timeout: Duration) -> Result<()>;

    /// Evaluate an expression, awaiting promises, returning the value
    async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value>;

    /// Cookies visible to the page's browsing context
    async fn cookies(&self) -> Result<Vec<Cookie>>;

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()>;

    async fn scroll(&self, delta_y: f64) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Check for a usable display environment.
///
/// Linux needs X11/Wayland or an Xvfb wrapper; macOS and Windows always have
/// a graphical session when a user process is running.
pub fn display_available() -> bool {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        return true;
    }

    if std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some() {
        return true;
    }

    // xvfb-run on PATH counts as a virtual display environment
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            if dir.join("xvfb-run").is_file() {
                tracing::debug!("Detected Xvfb environment");
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RoutePolicy {
        RoutePolicy {
            page_url: "https://labs.google/fx/tools/flow/project/p1".into(),
            page_body: "<html></html>".into(),
            allow_hosts: vec!["google.com".into(), "gstatic.com".into(), "recaptcha.net".into()],
        }
    }

    #[test]
    fn test_route_fulfills_canonical_url() {
        let p = policy();
        assert_eq!(
            p.decide("https://labs.google/fx/tools/flow/project/p1"),
            RouteAction::Fulfill
        );
        // Trailing slash normalization
        assert_eq!(
            p.decide("https://labs.google/fx/tools/flow/project/p1/"),
            RouteAction::Fulfill
        );
    }

    #[test]
    fn test_route_passes_provider_hosts() {
        let p = policy();
        assert_eq!(
            p.decide("https://www.google.com/recaptcha/enterprise.js?render=k"),
            RouteAction::Continue
        );
        assert_eq!(
            p.decide("https://www.gstatic.com/recaptcha/releases/x/recaptcha__en.js"),
            RouteAction::Continue
        );
    }

    #[test]
    fn test_route_aborts_third_party() {
        let p = policy();
        assert_eq!(
            p.decide("https://analytics.example.com/collect"),
            RouteAction::Abort
        );
        assert_eq!(
            p.decide("https://labs.google/fx/tools/flow/project/other"),
            RouteAction::Abort
        );
    }
}
