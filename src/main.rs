use chrono::Utc;
use circuit_monitor::{
    actor::{self, EngineHandle},
    config::Config,
    engine::Engine,
    mqtt::{self, Inbound},
    publish::{Publisher, Topics},
    scheduler::Scheduler,
    settings::Settings,
    watchdog::{Liveness, Watchdog},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const COMMAND_QUEUE_DEPTH: usize = 1024;
const EVENT_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    let settings = Settings::from_config(&cfg);
    info!(
        channels = settings.channel_names.len(),
        phase_monitoring = settings.phase_monitoring(),
        "loaded config from {}",
        cfg_path
    );

    let opts = mqtt::build_options(&cfg.mqtt)?;
    let (client, mut eventloop) = mqtt::new(opts);

    let topics = Topics::new(&cfg.publish.topic_prefix);
    let subscriptions = vec![
        (
            cfg.device.telemetry_topic.clone(),
            mqtt::qos(cfg.device.qos),
        ),
        (topics.command_filter(), mqtt::qos(cfg.publish.qos)),
    ];
    mqtt::subscribe_all(&client, &subscriptions).await?;
    info!(
        host = %cfg.mqtt.host,
        telemetry = %cfg.device.telemetry_topic,
        "subscribed to {} topic(s)",
        subscriptions.len()
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (handle, engine_task) = actor::spawn(Engine::new(settings), events_tx, COMMAND_QUEUE_DEPTH);

    let publisher = Publisher::new(client.clone(), &cfg.publish, cfg.device.address.clone());
    tokio::spawn(publisher.run(events_rx));

    let scheduler = Arc::new(Scheduler::new(handle.clone(), &cfg.schedule)?);
    {
        let s = scheduler.clone();
        tokio::spawn(async move { s.run_rollover().await });
    }
    tokio::spawn(async move { scheduler.run_refresh().await });

    let liveness = Liveness::new(Utc::now());
    let watchdog = Watchdog::new(
        client.clone(),
        subscriptions,
        liveness.clone(),
        Duration::from_secs(cfg.schedule.watchdog_interval_secs),
        Duration::from_secs(cfg.schedule.stale_after_secs),
    );
    tokio::spawn(async move { watchdog.run().await });

    #[cfg(unix)]
    {
        let path = cfg_path.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = reload_on_hangup(path, h).await {
                error!("config reload listener failed: {}", e);
            }
        });
    }

    let telemetry_filter = cfg.device.telemetry_topic.clone();
    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = mqtt::next_publish(&mut eventloop) => {
                match res {
                    Ok(Some(msg)) => {
                        let topic = match std::str::from_utf8(&msg.topic) {
                            Ok(s) => s.to_string(),
                            Err(_) => {
                                warn!(topic_bytes = ?msg.topic, "non-utf8 topic; skipping message");
                                continue;
                            }
                        };
                        let inbound = match mqtt::route_message(&telemetry_filter, &topics, &topic, msg.payload.as_ref()) {
                            Ok(inbound) => inbound,
                            Err(e) => {
                                warn!(topic = %topic, error = %e, "dropping malformed message");
                                continue;
                            }
                        };
                        if let Err(e) = dispatch(&handle, &liveness, inbound).await {
                            error!("engine unavailable: {}", e);
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    drop(handle);
    engine_task.abort();
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {}", e);
    }
    info!("shutdown complete");
    Ok(())
}

async fn dispatch(
    handle: &EngineHandle,
    liveness: &Liveness,
    inbound: Inbound,
) -> circuit_monitor::Result<()> {
    match inbound {
        Inbound::Samples(samples) => {
            liveness.mark(Utc::now());
            for sample in samples {
                handle.ingest(sample).await?;
            }
        }
        Inbound::Command(command) => {
            info!(?command, "operator command received");
            handle.send(command).await?;
        }
        Inbound::Ignored => {}
    }
    Ok(())
}

/// Re-read the config file on SIGHUP and push the new settings to the engine.
#[cfg(unix)]
async fn reload_on_hangup(path: String, handle: EngineHandle) -> circuit_monitor::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        match Config::load(&path) {
            Ok(cfg) => {
                info!("reloading settings from {}", path);
                handle.reconfigure(Settings::from_config(&cfg)).await?;
            }
            Err(e) => warn!(error = %e, "config reload failed; keeping current settings"),
        }
    }
    Ok(())
}
