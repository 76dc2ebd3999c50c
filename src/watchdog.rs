//! Telemetry liveness tracking.
//!
//! The main loop marks every telemetry message; the watchdog loop checks the
//! mark periodically and re-issues the subscriptions when the feed has gone
//! quiet, which recovers from brokers that drop session state.

use crate::mqtt::{self, AsyncClient, QoS};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Liveness {
    last_seen_ms: Arc<AtomicI64>,
}

impl Liveness {
    /// Starts as if a message arrived at `now`, so a fresh process is not
    /// immediately stale.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_seen_ms: Arc::new(AtomicI64::new(now.timestamp_millis())),
        }
    }

    pub fn mark(&self, now: DateTime<Utc>) {
        self.last_seen_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let silent_ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        silent_ms > stale_after.as_millis().min(i64::MAX as u128) as i64
    }
}

pub struct Watchdog {
    client: AsyncClient,
    subscriptions: Vec<(String, QoS)>,
    liveness: Liveness,
    check_every: Duration,
    stale_after: Duration,
}

impl Watchdog {
    pub fn new(
        client: AsyncClient,
        subscriptions: Vec<(String, QoS)>,
        liveness: Liveness,
        check_every: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            client,
            subscriptions,
            liveness,
            check_every: check_every.max(Duration::from_secs(1)),
            stale_after,
        }
    }

    pub async fn run(&self) {
        info!(
            check_secs = self.check_every.as_secs(),
            stale_secs = self.stale_after.as_secs(),
            "telemetry watchdog started"
        );
        let mut ticker = interval(self.check_every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !self.liveness.is_stale(now, self.stale_after) {
                debug!("telemetry feed alive");
                continue;
            }
            warn!(
                last_seen = ?self.liveness.last_seen(),
                "no telemetry received recently; re-subscribing"
            );
            match mqtt::subscribe_all(&self.client, &self.subscriptions).await {
                // Give the re-subscription a full window before checking again
                Ok(()) => self.liveness.mark(now),
                Err(e) => warn!(error = %e, "re-subscribe failed"),
            }
        }
    }
}
