//! Serialized access to the engine.
//!
//! Ingestion, scheduled rollovers, manual commands and reconfiguration all
//! go through one command queue owned by a single task, so a pass never
//! observes a half-applied mutation.

use crate::attribute::EventBatch;
use crate::engine::{Engine, Snapshot};
use crate::error::{AppError, Result};
use crate::sample::Sample;
use crate::settings::Settings;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum Command {
    Ingest(Sample),
    Rollover,
    ResetDailyEnergy,
    ForcePass,
    Reconfigure(Settings),
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Operator commands accepted on the command topic.
pub fn parse_operator_command(name: &str) -> Option<Command> {
    match name.trim().to_ascii_lowercase().as_str() {
        "reset_daily_energy" | "resetdailyenergy" => Some(Command::ResetDailyEnergy),
        "rollover" => Some(Command::Rollover),
        "force_pass" | "forcepass" | "refresh" => Some(Command::ForcePass),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| AppError::Engine("engine task has stopped".into()))
    }

    pub async fn ingest(&self, sample: Sample) -> Result<()> {
        self.send(Command::Ingest(sample)).await
    }

    pub async fn rollover(&self) -> Result<()> {
        self.send(Command::Rollover).await
    }

    pub async fn reset_daily_energy(&self) -> Result<()> {
        self.send(Command::ResetDailyEnergy).await
    }

    pub async fn force_pass(&self) -> Result<()> {
        self.send(Command::ForcePass).await
    }

    pub async fn reconfigure(&self, settings: Settings) -> Result<()> {
        self.send(Command::Reconfigure(settings)).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| AppError::Engine("engine dropped snapshot request".into()))
    }
}

/// Spawn the engine task. Event batches are forwarded to `events`; the task
/// ends when every handle is dropped.
pub fn spawn(
    engine: Engine,
    events: mpsc::Sender<EventBatch>,
    queue_depth: usize,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth);
    let task = tokio::spawn(run(engine, rx, events));
    (EngineHandle { tx }, task)
}

async fn run(
    mut engine: Engine,
    mut rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<EventBatch>,
) {
    while let Some(command) = rx.recv().await {
        let now = Utc::now();
        let produced = match command {
            Command::Ingest(sample) => engine.ingest(&sample, now),
            Command::Rollover => engine.rollover(now),
            Command::ResetDailyEnergy => engine.reset_daily_energy(now),
            Command::ForcePass => engine.force_pass(now),
            Command::Reconfigure(settings) => {
                engine.apply_settings(settings);
                Vec::new()
            }
            Command::Snapshot(reply) => {
                if reply.send(engine.snapshot()).is_err() {
                    debug!("snapshot requester went away");
                }
                Vec::new()
            }
        };

        if produced.is_empty() {
            continue;
        }
        let batch = EventBatch {
            at: now,
            events: produced,
        };
        if events.send(batch).await.is_err() {
            warn!("event consumer closed; stopping engine task");
            break;
        }
    }
    info!("engine task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{names, Event};

    #[tokio::test]
    async fn commands_are_applied_in_order() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handle, task) = spawn(Engine::new(Settings::default()), events_tx, 16);

        handle
            .ingest(Sample::numeric("voltage", 109.0))
            .await
            .unwrap();
        handle.ingest(Sample::numeric("power_1", 75.0)).await.unwrap();

        let first = events_rx.recv().await.unwrap();
        assert!(first.events.iter().any(|e| matches!(
            e,
            Event::Attribute(a) if a.name == names::GRID_STATUS && a.text() == Some("Brownout")
        )));
        let second = events_rx.recv().await.unwrap();
        assert!(matches!(
            second.events[0],
            Event::ChannelDiscovered { index: 1, .. }
        ));

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.totals.power, 75.0);
        assert_eq!(snap.channels.len(), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn rollover_publishes_even_inside_interval() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handle, _task) = spawn(Engine::new(Settings::default()), events_tx, 16);

        handle.ingest(Sample::numeric("energy_1", 3.5)).await.unwrap();
        events_rx.recv().await.unwrap();

        handle.rollover().await.unwrap();
        let batch = events_rx.recv().await.unwrap();
        assert!(batch.events.iter().any(|e| matches!(
            e,
            Event::Attribute(a) if a.name == names::ENERGY && a.number() == Some(0.0)
        )));
    }

    #[tokio::test]
    async fn reconfigure_is_serialized_with_ingest() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (handle, _task) = spawn(Engine::new(Settings::default()), events_tx, 16);

        let mut settings = Settings::default();
        settings.imbalance_threshold = None;
        handle.reconfigure(settings).await.unwrap();
        handle.force_pass().await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.phase_status, crate::health::PhaseStatus::Disabled);
    }

    #[test]
    fn operator_command_names() {
        assert!(matches!(
            parse_operator_command("Reset_Daily_Energy"),
            Some(Command::ResetDailyEnergy)
        ));
        assert!(matches!(parse_operator_command("rollover"), Some(Command::Rollover)));
        assert!(matches!(parse_operator_command("refresh"), Some(Command::ForcePass)));
        assert!(parse_operator_command("reboot").is_none());
    }
}
