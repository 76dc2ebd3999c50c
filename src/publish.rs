//! Publishes engine events to MQTT for the downstream automation system.
//!
//! Layout under the configured prefix:
//! - `<prefix>/aggregate/<attribute>`
//! - `<prefix>/channel/<n>/<attribute>`
//! - `<prefix>/channel/<n>/meta` when a channel is first seen
//! - `<prefix>/cmd/<command>` for inbound operator commands

use crate::attribute::{Attribute, AttributeValue, ChannelIndex, Event, EventBatch, Target};
use crate::config::PublishConfig;
use crate::error::{AppError, Result};
use crate::mqtt::{self, AsyncClient, QoS};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn attribute(&self, attr: &Attribute) -> String {
        match attr.target {
            Target::Aggregate => format!("{}/aggregate/{}", self.prefix, attr.name),
            Target::Channel(index) => format!("{}/channel/{}/{}", self.prefix, index, attr.name),
        }
    }

    pub fn channel_meta(&self, index: ChannelIndex) -> String {
        format!("{}/channel/{}/meta", self.prefix, index)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/cmd/+", self.prefix)
    }

    /// The command name if `topic` is a command topic.
    pub fn command_name<'t>(&self, topic: &'t str) -> Option<&'t str> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/cmd/")
            .filter(|name| !name.is_empty() && !name.contains('/'))
    }
}

/// JSON body for one attribute update.
pub fn attribute_payload(attr: &Attribute, at: DateTime<Utc>) -> Result<Value> {
    let value = match &attr.value {
        AttributeValue::Number(n) => Value::Number(
            serde_json::Number::from_f64(*n)
                .ok_or_else(|| AppError::Other(anyhow::anyhow!("invalid f64: {}", n)))?,
        ),
        AttributeValue::Text(t) => Value::String(t.clone()),
        AttributeValue::Cleared => Value::Null,
    };

    let mut obj = Map::new();
    obj.insert("value".to_string(), value);
    if let Some(unit) = attr.unit {
        obj.insert("unit".to_string(), Value::String(unit.to_string()));
    }
    obj.insert("ts".to_string(), Value::String(at.to_rfc3339()));
    Ok(Value::Object(obj))
}

pub fn discovery_payload(index: ChannelIndex, label: &str, device: Option<&str>) -> Value {
    json!({
        "index": index,
        "name": label,
        "device": device,
    })
}

pub struct Publisher {
    client: AsyncClient,
    topics: Topics,
    qos: QoS,
    retain: bool,
    device: Option<String>,
}

impl Publisher {
    pub fn new(client: AsyncClient, cfg: &PublishConfig, device: Option<String>) -> Self {
        Self {
            client,
            topics: Topics::new(&cfg.topic_prefix),
            qos: mqtt::qos(cfg.qos),
            retain: cfg.retain,
            device,
        }
    }

    /// Drain event batches until the engine side closes the queue.
    pub async fn run(self, mut rx: mpsc::Receiver<EventBatch>) {
        while let Some(batch) = rx.recv().await {
            for event in &batch.events {
                if let Err(e) = self.publish_event(event, batch.at).await {
                    error!(error = %e, "failed to publish event");
                }
            }
            debug!(count = batch.events.len(), "published event batch");
        }
        info!("publisher finished");
    }

    async fn publish_event(&self, event: &Event, at: DateTime<Utc>) -> Result<()> {
        let (topic, body) = match event {
            Event::Attribute(attr) => (self.topics.attribute(attr), attribute_payload(attr, at)?),
            Event::ChannelDiscovered { index, label } => (
                self.topics.channel_meta(*index),
                discovery_payload(*index, label, self.device.as_deref()),
            ),
        };
        let bytes = serde_json::to_vec(&body)?;
        self.client
            .publish(topic.clone(), self.qos, self.retain, bytes)
            .await
            .map_err(|e| AppError::Mqtt(format!("publish {topic}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::names;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn attr(target: Target, name: &'static str, value: AttributeValue) -> Attribute {
        Attribute {
            target,
            name,
            value,
            unit: crate::attribute::unit_for(name),
        }
    }

    #[test]
    fn topic_layout() {
        let topics = Topics::new("home/energy/");
        assert_eq!(
            topics.attribute(&attr(Target::Aggregate, names::POWER, AttributeValue::Number(1.0))),
            "home/energy/aggregate/power"
        );
        assert_eq!(
            topics.attribute(&attr(
                Target::Channel(4),
                names::LOAD_PERCENT,
                AttributeValue::Number(1.0)
            )),
            "home/energy/channel/4/loadPercent"
        );
        assert_eq!(topics.channel_meta(4), "home/energy/channel/4/meta");
        assert_eq!(topics.command_filter(), "home/energy/cmd/+");
    }

    #[test]
    fn command_topics() {
        let topics = Topics::new("cm");
        assert_eq!(topics.command_name("cm/cmd/rollover"), Some("rollover"));
        assert_eq!(topics.command_name("cm/cmd/"), None);
        assert_eq!(topics.command_name("cm/cmd/a/b"), None);
        assert_eq!(topics.command_name("cmx/cmd/rollover"), None);
        assert_eq!(topics.command_name("cm/aggregate/power"), None);
    }

    #[test]
    fn payload_shapes() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        let body = attribute_payload(
            &attr(Target::Aggregate, names::ENERGY, AttributeValue::Number(1.25)),
            at,
        )
        .unwrap();
        assert_eq!(
            body,
            json!({"value": 1.25, "unit": "kWh", "ts": "2026-01-02T03:04:05+00:00"})
        );

        let body = attribute_payload(
            &attr(
                Target::Channel(1),
                names::LOWEST_DAILY_WATTS,
                AttributeValue::Cleared,
            ),
            at,
        )
        .unwrap();
        assert_eq!(body["value"], Value::Null);

        let body = attribute_payload(
            &attr(
                Target::Aggregate,
                names::GRID_STATUS,
                AttributeValue::Text("Surge".into()),
            ),
            at,
        )
        .unwrap();
        assert_eq!(body, json!({"value": "Surge", "ts": "2026-01-02T03:04:05+00:00"}));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let at = Utc::now();
        let bad = attr(Target::Aggregate, names::POWER, AttributeValue::Number(f64::NAN));
        assert!(attribute_payload(&bad, at).is_err());
    }

    #[test]
    fn discovery_body() {
        assert_eq!(
            discovery_payload(3, "Dryer", Some("10.0.0.5")),
            json!({"index": 3, "name": "Dryer", "device": "10.0.0.5"})
        );
    }
}
