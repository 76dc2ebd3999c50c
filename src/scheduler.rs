//! Background timers driving the engine.
//!
//! One loop fires the daily rollover at a local wall-clock time, the other
//! forces a publish pass every `refresh_interval_secs` so consumers see fresh
//! values even when the device is quiet.

use crate::actor::EngineHandle;
use crate::config::ScheduleConfig;
use crate::error::Result;
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Utc};
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Next instant strictly after `now` at which the local clock reads `at`.
///
/// Days where `at` does not exist locally (DST gap) are skipped; an
/// ambiguous local time resolves to its earlier instant.
pub fn next_rollover<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Utc> {
    let tz = now.timezone();
    let today = now.date_naive();
    for offset in 0..=7 {
        let Some(day) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate.with_timezone(&Utc);
            }
        }
    }
    now.with_timezone(&Utc) + chrono::Duration::hours(24)
}

pub struct Scheduler {
    handle: EngineHandle,
    rollover_at: NaiveTime,
    refresh_every: Option<Duration>,
}

impl Scheduler {
    pub fn new(handle: EngineHandle, config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            handle,
            rollover_at: config.rollover_at()?,
            refresh_every: (config.refresh_interval_secs > 0)
                .then(|| Duration::from_secs(config.refresh_interval_secs)),
        })
    }

    /// Sleep until the next local rollover, trigger it, repeat. Returns when
    /// the engine task is gone.
    pub async fn run_rollover(&self) {
        tracing::info!(
            "rollover scheduler started (local time {})",
            self.rollover_at.format("%H:%M")
        );
        loop {
            let now = Local::now();
            let due = next_rollover(&now, self.rollover_at);
            let wait = (due - now.with_timezone(&Utc))
                .to_std()
                .unwrap_or(Duration::ZERO);
            tracing::debug!(due = %due, "next rollover scheduled");
            sleep(wait).await;

            tracing::info!("daily rollover due");
            if let Err(e) = self.handle.rollover().await {
                tracing::error!("rollover scheduler stopping: {}", e);
                return;
            }
        }
    }

    pub async fn run_refresh(&self) {
        let Some(every) = self.refresh_every else {
            tracing::info!("refresh ticker disabled");
            return;
        };
        tracing::info!("refresh ticker started (interval: {}s)", every.as_secs());
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.handle.force_pass().await {
                tracing::error!("refresh ticker stopping: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::settings::Settings;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn rollover_later_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap();
        assert_eq!(
            next_rollover(&now, hm(23, 0)),
            Utc.with_ymd_and_hms(2026, 3, 10, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn rollover_tomorrow_when_already_passed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(
            next_rollover(&now, hm(0, 0)),
            Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn rollover_respects_local_offset() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2026, 3, 10, 22, 0, 0).unwrap();
        // Local midnight at UTC-5 is 05:00 UTC the next day
        assert_eq!(
            next_rollover(&now, hm(0, 0)),
            Utc.with_ymd_and_hms(2026, 3, 11, 5, 0, 0).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_ticker_forces_passes() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (handle, _task) = crate::actor::spawn(Engine::new(Settings::default()), events_tx, 16);

        let config = ScheduleConfig {
            refresh_interval_secs: 10,
            ..ScheduleConfig::default()
        };
        let scheduler = Scheduler::new(handle.clone(), &config).unwrap();
        let ticker = tokio::spawn(async move { scheduler.run_refresh().await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.last_pass_at.is_some());

        ticker.abort();
    }

    #[tokio::test]
    async fn zero_refresh_interval_disables_ticker() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (handle, _task) = crate::actor::spawn(Engine::new(Settings::default()), events_tx, 16);
        let config = ScheduleConfig {
            refresh_interval_secs: 0,
            ..ScheduleConfig::default()
        };
        let scheduler = Scheduler::new(handle.clone(), &config).unwrap();
        scheduler.run_refresh().await;
        assert!(handle.snapshot().await.unwrap().last_pass_at.is_none());
    }

    #[tokio::test]
    async fn bad_rollover_time_is_rejected() {
        let (events_tx, _events_rx) = mpsc::channel(1);
        let (handle, _task) = crate::actor::spawn(Engine::new(Settings::default()), events_tx, 1);
        let config = ScheduleConfig {
            rollover_time: "25:99".into(),
            ..ScheduleConfig::default()
        };
        assert!(Scheduler::new(handle, &config).is_err());
    }
}
