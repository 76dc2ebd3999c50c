use crate::actor::{parse_operator_command, Command};
use crate::config::MqttConfig;
use crate::error::{AppError, Result};
use crate::publish::Topics;
use crate::sample::{decode_samples, Sample};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type QoS = mqtt5::mqttbytes::QoS;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;

pub fn build_options(cfg: &MqttConfig) -> Result<MqttOptions> {
    let client_id = format!("circuit-monitor-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    match &cfg.tls {
        Some(tls) => {
            let ca = std::fs::read(&tls.ca_file)?;
            opts.set_transport(Transport::tls(ca, None, None));
        }
        None if cfg.port == 8883 => {
            opts.set_transport(Transport::tls_with_default_config());
        }
        None => {}
    }
    Ok(opts)
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

pub fn qos(v: u8) -> QoS {
    match v {
        2 => QoS::ExactlyOnce,
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub async fn next_publish(eventloop: &mut EventLoop) -> Result<Option<V5Publish>> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => return Ok(Some(p)),
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

/// Subscribe to every topic in `subscriptions`.
pub async fn subscribe_all(client: &AsyncClient, subscriptions: &[(String, QoS)]) -> Result<()> {
    for (topic, q) in subscriptions {
        client
            .subscribe(topic.clone(), *q)
            .await
            .map_err(|e| AppError::Mqtt(format!("subscribe {topic}: {e}")))?;
    }
    Ok(())
}

/// MQTT topic filter match supporting `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let fseg: Vec<&str> = filter.split('/').collect();
    let tseg: Vec<&str> = topic.split('/').collect();
    for (i, f) in fseg.iter().enumerate() {
        match *f {
            "#" => return true,
            "+" => {
                if i >= tseg.len() {
                    return false;
                }
            }
            _ => {
                if i >= tseg.len() || *f != tseg[i] {
                    return false;
                }
            }
        }
    }
    fseg.len() == tseg.len()
}

#[derive(Debug)]
pub enum Inbound {
    Samples(Vec<Sample>),
    Command(Command),
    Ignored,
}

/// Decide what an incoming message is. Malformed telemetry is reported as
/// an error so the caller can log it and move on.
pub fn route_message(
    telemetry_filter: &str,
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<Inbound> {
    if let Some(name) = topics.command_name(topic) {
        return match parse_operator_command(name) {
            Some(command) => Ok(Inbound::Command(command)),
            None => {
                warn!(topic, command = name, "unknown operator command");
                Ok(Inbound::Ignored)
            }
        };
    }
    if topic_matches(telemetry_filter, topic) {
        return decode_samples(payload).map(Inbound::Samples);
    }
    Ok(Inbound::Ignored)
}
