//! Session pool
//!
//! Owns the slot registry and the admission semaphore. Capacity comes from
//! the `ConfigSource` on first use (one-shot bootstrap, no globals) and can
//! be re-read at runtime; shrinking evicts the slots that fell outside the
//! new capacity. Checkout hands out slots round-robin under a permit, so at
//! most `capacity` challenge flows run at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, OwnedSemaphorePermit, Semaphore};

use crate::config::{ConfigSource, PoolConfig, PoolSettings};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::proxy::{parse_proxy_url, ProxyConfig};
use crate::session::Session;

/// Pool-wide counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub acquisitions: AtomicU64,
    pub tokens_issued: AtomicU64,
    pub attempt_failures: AtomicU64,
    pub invalid_reports: AtomicU64,
    pub sessions_recycled: AtomicU64,
}

/// Read-only view of the pool counters plus registry size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub capacity: usize,
    pub active_sessions: usize,
    pub acquisitions: u64,
    pub tokens_issued: u64,
    pub attempt_failures: u64,
    pub invalid_reports: u64,
    pub sessions_recycled: u64,
}

struct PoolState {
    sessions: HashMap<usize, Arc<Session>>,
    capacity: usize,
    proxy: Option<ProxyConfig>,
    /// Invalid-token reports per slot, for the force-close policy
    invalid_counts: HashMap<usize, u32>,
}

/// Pool of long-lived browser slots
pub struct SessionPool {
    driver: Arc<dyn Driver>,
    config: Arc<PoolConfig>,
    source: Arc<dyn ConfigSource>,
    semaphore: Arc<Semaphore>,
    bootstrap: OnceCell<()>,
    state: Mutex<PoolState>,
    cursor: AtomicUsize,
    /// Permits still owed from a capacity shrink, retired at checkout
    retire_debt: AtomicUsize,
    stats: PoolStats,
}

fn resolve_proxy(settings: &PoolSettings) -> Option<ProxyConfig> {
    if !settings.proxy_enabled {
        return None;
    }
    match settings.proxy_url.as_deref() {
        Some(raw) => {
            let proxy = parse_proxy_url(raw);
            if proxy.is_none() {
                tracing::warn!("Proxy enabled but URL is unusable, continuing without proxy");
            }
            proxy
        }
        None => None,
    }
}

impl SessionPool {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: Arc<PoolConfig>,
        source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            driver,
            config,
            source,
            semaphore: Arc::new(Semaphore::new(0)),
            bootstrap: OnceCell::new(),
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                capacity: 0,
                proxy: None,
                invalid_counts: HashMap::new(),
            }),
            cursor: AtomicUsize::new(0),
            retire_debt: AtomicUsize::new(0),
            stats: PoolStats::default(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &Arc<PoolConfig> {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// One-shot bootstrap: read settings and open the admission gate.
    /// Concurrent callers all wait on the same initialization.
    async fn ensure_ready(&self) -> Result<()> {
        self.bootstrap
            .get_or_try_init(|| async {
                let settings = self.source.load().await?;
                let capacity = settings.effective_capacity();

                let mut state = self.state.lock().await;
                state.capacity = capacity;
                state.proxy = resolve_proxy(&settings);
                self.semaphore.add_permits(capacity);

                tracing::info!(capacity, "Session pool ready");
                Ok::<_, Error>(())
            })
            .await?;
        Ok(())
    }

    /// Wait for an admission permit and hand out the next slot round-robin.
    /// The permit must be held for the whole acquisition; dropping it
    /// releases the slot's share of the concurrency budget.
    pub async fn checkout(&self) -> Result<(Arc<Session>, OwnedSemaphorePermit)> {
        self.ensure_ready().await?;

        let permit = loop {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| Error::Unavailable("pool is shut down".into()))?;

            // A shrink may still be owed permits held by acquisitions that
            // were in flight at reload time; settle that debt before
            // admitting so the new capacity is never exceeded.
            let owed = self
                .retire_debt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                    debt.checked_sub(1)
                })
                .is_ok();
            if owed {
                permit.forget();
                continue;
            }
            break permit;
        };
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().await;
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % state.capacity;
        let session = Arc::clone(state.sessions.entry(slot).or_insert_with(|| {
            Arc::new(Session::new(
                slot,
                Arc::clone(&self.driver),
                Arc::clone(&self.config),
            ))
        }));

        Ok((session, permit))
    }

    /// Proxy to apply to browsers launched after this call
    pub async fn proxy(&self) -> Option<ProxyConfig> {
        self.state.lock().await.proxy.clone()
    }

    /// Re-read settings and resize the pool. Growing adds permits; shrinking
    /// retires free permits immediately, books the rest as checkout debt,
    /// and evicts every slot at or above the new capacity. In-flight
    /// acquisitions are never interrupted, but no admission after the
    /// reload ever exceeds the new capacity.
    pub async fn reload_capacity(&self) -> Result<usize> {
        self.ensure_ready().await?;
        let settings = self.source.load().await?;
        let new_capacity = settings.effective_capacity();

        let evicted: Vec<Arc<Session>> = {
            let mut state = self.state.lock().await;
            let old_capacity = state.capacity;
            state.capacity = new_capacity;
            state.proxy = resolve_proxy(&settings);

            if new_capacity > old_capacity {
                self.semaphore.add_permits(new_capacity - old_capacity);
            } else if new_capacity < old_capacity {
                // forget_permits only retires permits that are free right
                // now; the remainder are held by in-flight acquisitions and
                // return to the semaphore when their permits drop. Record
                // those as a debt that checkout settles before admitting.
                let surplus = old_capacity - new_capacity;
                let forgotten = self.semaphore.forget_permits(surplus);
                self.retire_debt
                    .fetch_add(surplus - forgotten, Ordering::AcqRel);
            }

            let stale: Vec<usize> = state
                .sessions
                .keys()
                .copied()
                .filter(|slot| *slot >= new_capacity)
                .collect();
            for slot in &stale {
                state.invalid_counts.remove(slot);
            }
            stale
                .into_iter()
                .filter_map(|slot| state.sessions.remove(&slot))
                .collect()
        };

        for session in evicted {
            tracing::info!(slot = session.slot(), "Evicting slot after capacity shrink");
            session.force_close().await;
            self.stats.sessions_recycled.fetch_add(1, Ordering::Relaxed);
        }

        tracing::info!(capacity = new_capacity, "Capacity reloaded");
        Ok(new_capacity)
    }

    /// Close and forget one slot. The slot number stays valid; the next
    /// checkout that lands on it starts a fresh session.
    pub async fn remove_session(&self, slot: usize) -> bool {
        let session = {
            let mut state = self.state.lock().await;
            state.invalid_counts.remove(&slot);
            state.sessions.remove(&slot)
        };
        match session {
            Some(session) => {
                session.force_close().await;
                self.stats.sessions_recycled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Record an invalid-token report against a slot. Returns true when the
    /// configured threshold was crossed and the slot's session was retired.
    pub async fn record_invalid(&self, slot: usize) -> bool {
        self.stats.invalid_reports.fetch_add(1, Ordering::Relaxed);

        let Some(threshold) = self.config.invalid_report_threshold else {
            return false;
        };

        let crossed = {
            let mut state = self.state.lock().await;
            let count = state.invalid_counts.entry(slot).or_insert(0);
            *count += 1;
            *count >= threshold
        };

        if crossed {
            tracing::warn!(slot, threshold, "Invalid-report threshold crossed, retiring slot");
            self.remove_session(slot).await
        } else {
            false
        }
    }

    /// Close every session and stop admitting new acquisitions
    pub async fn shutdown(&self) {
        self.semaphore.close();

        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.lock().await;
            state.invalid_counts.clear();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.force_close().await;
        }
        tracing::info!("Session pool shut down");
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.lock().await;
        StatsSnapshot {
            capacity: state.capacity,
            active_sessions: state.sessions.len(),
            acquisitions: self.stats.acquisitions.load(Ordering::Relaxed),
            tokens_issued: self.stats.tokens_issued.load(Ordering::Relaxed),
            attempt_failures: self.stats.attempt_failures.load(Ordering::Relaxed),
            invalid_reports: self.stats.invalid_reports.load(Ordering::Relaxed),
            sessions_recycled: self.stats.sessions_recycled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticSource;
    use crate::driver::StubDriver;
    use std::time::Duration;

    fn quick_config() -> PoolConfig {
        PoolConfig {
            warmup: false,
            ..PoolConfig::default()
        }
    }

    fn pool_with_capacity(capacity: usize) -> (SessionPool, StubDriver) {
        let driver = StubDriver::new();
        let source = StaticSource::new(PoolSettings {
            capacity,
            proxy_enabled: false,
            proxy_url: None,
        });
        let pool = SessionPool::new(
            Arc::new(driver.clone()),
            Arc::new(quick_config()),
            Arc::new(source),
        );
        (pool, driver)
    }

    #[tokio::test]
    async fn test_checkout_is_round_robin() {
        let (pool, _driver) = pool_with_capacity(2);

        let (s0, p0) = pool.checkout().await.unwrap();
        drop(p0);
        let (s1, p1) = pool.checkout().await.unwrap();
        drop(p1);
        let (s2, p2) = pool.checkout().await.unwrap();
        drop(p2);

        assert_eq!(s0.slot(), 0);
        assert_eq!(s1.slot(), 1);
        assert_eq!(s2.slot(), 0);
        // Slot 0 is the same session object both times
        assert!(Arc::ptr_eq(&s0, &s2));
    }

    #[tokio::test]
    async fn test_capacity_clamped_to_one() {
        let (pool, _driver) = pool_with_capacity(0);
        let (session, _permit) = pool.checkout().await.unwrap();
        assert_eq!(session.slot(), 0);
        assert_eq!(pool.snapshot().await.capacity, 1);
    }

    #[tokio::test]
    async fn test_shrink_evicts_out_of_range_slots() {
        let driver = StubDriver::new();
        let source = Arc::new(StaticSource::new(PoolSettings {
            capacity: 4,
            proxy_enabled: false,
            proxy_url: None,
        }));
        let pool = SessionPool::new(
            Arc::new(driver.clone()),
            Arc::new(quick_config()),
            Arc::clone(&source) as Arc<dyn ConfigSource>,
        );

        // Touch all four slots so they exist, with a solve so processes launch
        for _ in 0..4 {
            let (session, _permit) = pool.checkout().await.unwrap();
            session.solve("proj", "a", None).await.unwrap();
        }
        assert_eq!(pool.snapshot().await.active_sessions, 4);

        source.set(PoolSettings {
            capacity: 2,
            proxy_enabled: false,
            proxy_url: None,
        });
        assert_eq!(pool.reload_capacity().await.unwrap(), 2);

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.capacity, 2);
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.sessions_recycled, 2);
        // Both evicted slots shut their browsers down
        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_shrink_under_load_caps_future_admissions() {
        let driver = StubDriver::new();
        let source = Arc::new(StaticSource::new(PoolSettings {
            capacity: 4,
            proxy_enabled: false,
            proxy_url: None,
        }));
        let pool = SessionPool::new(
            Arc::new(driver.clone()),
            Arc::new(quick_config()),
            Arc::clone(&source) as Arc<dyn ConfigSource>,
        );

        // Three acquisitions in flight across the shrink
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.checkout().await.unwrap());
        }

        source.set(PoolSettings {
            capacity: 2,
            proxy_enabled: false,
            proxy_url: None,
        });
        assert_eq!(pool.reload_capacity().await.unwrap(), 2);

        // Their permits return now; the surplus must be retired, not re-admitted
        drop(held);

        let _first = pool.checkout().await.unwrap();
        let _second = pool.checkout().await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(
            third.is_err(),
            "third concurrent checkout admitted after shrink to capacity 2"
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_checkouts() {
        let (pool, driver) = pool_with_capacity(1);
        let (session, permit) = pool.checkout().await.unwrap();
        session.solve("proj", "a", None).await.unwrap();
        drop(permit);

        pool.shutdown().await;
        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 1);

        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_reports_without_threshold_only_count() {
        let (pool, _driver) = pool_with_capacity(1);
        let (_session, _permit) = pool.checkout().await.unwrap();

        assert!(!pool.record_invalid(0).await);
        assert!(!pool.record_invalid(0).await);
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.invalid_reports, 2);
        assert_eq!(snapshot.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_invalid_report_threshold_retires_slot() {
        let driver = StubDriver::new();
        let config = PoolConfig {
            invalid_report_threshold: Some(2),
            ..quick_config()
        };
        let pool = SessionPool::new(
            Arc::new(driver.clone()),
            Arc::new(config),
            Arc::new(StaticSource::default()),
        );

        let (session, _permit) = pool.checkout().await.unwrap();
        session.solve("proj", "a", None).await.unwrap();

        assert!(!pool.record_invalid(0).await);
        assert!(pool.record_invalid(0).await);
        assert_eq!(pool.snapshot().await.active_sessions, 0);
        assert_eq!(driver.log().process_closes.load(Ordering::Relaxed), 1);
    }
}
