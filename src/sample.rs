//! Decoding of inbound telemetry samples and classification of their ids.

use crate::attribute::ChannelIndex;
use crate::error::{AppError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sample {
    pub id: String,
    #[serde(default)]
    pub value: SampleValue,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Text(String),
    #[default]
    Missing,
}

impl SampleValue {
    /// Numeric reading, accepting numbers sent as strings.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SampleValue::Number(n) => Some(*n),
            SampleValue::Text(s) => s.trim().parse::<f64>().ok(),
            SampleValue::Missing => None,
        }
        .filter(|n| n.is_finite())
    }
}

impl Sample {
    pub fn numeric(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: SampleValue::Number(value),
            state: None,
        }
    }

    /// Literal textual state: `state` when present, otherwise the value as text.
    pub fn text(&self) -> Option<String> {
        if let Some(state) = &self.state {
            return Some(state.clone());
        }
        match &self.value {
            SampleValue::Text(s) => Some(s.clone()),
            SampleValue::Number(n) => Some(n.to_string()),
            SampleValue::Missing => None,
        }
    }
}

/// Decode a transport payload: one sample object or an array of them.
/// Entries that fail to decode are dropped individually.
pub fn decode_samples(payload: &[u8]) -> Result<Vec<Sample>> {
    let json: Value = serde_json::from_slice(payload)?;
    let items = match json {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(AppError::Sample(format!(
                "expected an object or array, got {other}"
            )))
        }
    };

    let mut samples = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Sample>(item) {
            Ok(sample) if !sample.id.trim().is_empty() => samples.push(sample),
            Ok(_) => debug!("dropping sample with empty id"),
            Err(e) => debug!(error = %e, "dropping malformed sample"),
        }
    }
    Ok(samples)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Power,
    Current,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Voltage,
    Frequency,
    Temperature,
    Uptime,
    ChannelMetric {
        quantity: Quantity,
        index: ChannelIndex,
    },
    Unknown,
}

fn channel_metric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(power|current|energy|amperage)_(\d+)").expect("static pattern compiles")
    })
}

/// Classify a sample id. Global scalars take priority over channel metrics.
pub fn classify(id: &str) -> SampleKind {
    let id = id.to_ascii_lowercase();

    if id.contains("voltage") {
        return SampleKind::Voltage;
    }
    if id.contains("frequency") {
        return SampleKind::Frequency;
    }
    if id.contains("temperature") {
        return SampleKind::Temperature;
    }
    if id.contains("uptime") {
        return SampleKind::Uptime;
    }
    if id.contains("internal") {
        return SampleKind::Unknown;
    }

    let Some(caps) = channel_metric_pattern().captures(&id) else {
        return SampleKind::Unknown;
    };
    let quantity = match &caps[1] {
        "power" => Quantity::Power,
        "energy" => Quantity::Energy,
        _ => Quantity::Current,
    };
    match caps[2].parse::<ChannelIndex>() {
        Ok(index) if index > 0 => SampleKind::ChannelMetric { quantity, index },
        _ => SampleKind::Unknown,
    }
}
