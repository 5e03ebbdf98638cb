//! Per-host minimum-interval gate
//!
//! `wait(host)` returns no sooner than `interval(host)` after the previous
//! `wait(host)` returned. Callers reserve their slot under a short lock and
//! then sleep outside it, so concurrent callers queue up one interval apart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::config::RateLimitConfig;
use crate::context::RequestContext;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct HostSlot {
    interval: Duration,
    last_release: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    default_interval: Duration,
    hosts: Mutex<HashMap<String, HostSlot>>,
}

impl RateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limiter = Self::new(Duration::from_millis(config.default_interval_ms));
        for (host, ms) in &config.hosts {
            limiter.set_interval(host, Duration::from_millis(*ms));
        }
        limiter
    }

    pub fn set_interval(&self, host: &str, interval: Duration) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        hosts
            .entry(host.to_string())
            .and_modify(|slot| slot.interval = interval)
            .or_insert(HostSlot {
                interval,
                last_release: None,
            });
    }

    pub fn interval(&self, host: &str) -> Duration {
        let hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        hosts
            .get(host)
            .map(|s| s.interval)
            .unwrap_or(self.default_interval)
    }

    /// Claim the next release time for `host`
    fn reserve(&self, host: &str) -> Instant {
        let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        let default_interval = self.default_interval;
        let slot = hosts.entry(host.to_string()).or_insert(HostSlot {
            interval: default_interval,
            last_release: None,
        });
        let now = Instant::now();
        let release = match slot.last_release {
            Some(last) if last + slot.interval > now => last + slot.interval,
            _ => now,
        };
        slot.last_release = Some(release);
        release
    }

    /// Block until `host` may be hit again
    pub async fn wait(&self, host: &str) {
        let release = self.reserve(host);
        if release > Instant::now() {
            log::debug!("rate limit: waiting {:?} for {}", release - Instant::now(), host);
            sleep_until(release).await;
        }
    }

    /// Like `wait`, but gives up when the context finishes
    pub async fn wait_ctx(&self, ctx: &RequestContext, host: &str) -> Result<()> {
        let release = self.reserve(host);
        ctx.run(async {
            sleep_until(release).await;
            Ok(())
        })
        .await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_two_waiters_are_spaced() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
        let start = Instant::now();

        let a = {
            let l = limiter.clone();
            tokio::spawn(async move {
                l.wait("h").await;
                Instant::now()
            })
        };
        let b = {
            let l = limiter.clone();
            tokio::spawn(async move {
                l.wait("h").await;
                Instant::now()
            })
        };
        let (ta, tb) = (a.await.unwrap(), b.await.unwrap());
        let (first, second) = if ta <= tb { (ta, tb) } else { (tb, ta) };
        assert_eq!(first, start);
        assert!(second - first >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_waiters_respect_interval() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move {
                l.wait("h").await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.set_interval("fast", Duration::from_millis(10));
        let start = Instant::now();
        limiter.wait("slow").await;
        limiter.wait("fast").await;
        limiter.wait("fast").await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.interval("unknown"), Duration::from_secs(1));
    }
}
