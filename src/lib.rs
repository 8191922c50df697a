//! Pooled stealth-browser acquisition of anti-bot verification tokens.
//!
//! `captok` keeps a pool of long-lived automated browser sessions, each with
//! its own rotating declared identity, and runs the provider's challenge
//! script inside a synthetic host page to mint tokens on demand. Admission
//! to the pool is capped, failed attempts recycle the slot's browser, and
//! capacity can be re-read from configuration at runtime.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use captok::{CdpDriver, PoolConfig, StaticSource, TokenService};
//!
//! #[tokio::main]
//! async fn main() -> captok::Result<()> {
//!     let service = TokenService::new(
//!         Arc::new(CdpDriver::new()),
//!         PoolConfig::default(),
//!         Arc::new(StaticSource::default()),
//!     );
//!
//!     let acquisition = service.acquire_token("my-project", "IMAGE_GENERATION").await?;
//!     match acquisition.token {
//!         Some(token) => println!("{}", token),
//!         None => eprintln!("retry budget exhausted on slot {}", acquisition.slot),
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod driver;
pub mod error;
pub mod identity;
pub mod pool;
pub mod proxy;
pub mod service;
pub mod session;
pub mod warmup;

pub use config::{ConfigSource, PoolConfig, PoolSettings, StaticSource};
pub use driver::{
    BrowserContext, BrowserPage, BrowserProcess, CdpDriver, Cookie, Driver, LaunchOptions,
    RouteAction, RoutePolicy, StubDriver,
};
pub use error::{Error, Result};
pub use identity::{Identity, Viewport};
pub use pool::{SessionPool, StatsSnapshot};
pub use proxy::{parse_proxy_url, ProxyConfig};
pub use service::{Acquisition, TokenService};
pub use session::Session;
