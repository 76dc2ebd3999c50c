//! Attribute events produced by the engine and consumed by the publisher.

use chrono::{DateTime, Utc};

pub type ChannelIndex = u32;

/// Attribute names as they appear on the wire.
pub mod names {
    pub const POWER: &str = "power";
    pub const ENERGY: &str = "energy";
    pub const AMPERAGE: &str = "amperage";
    pub const VOLTAGE: &str = "voltage";
    pub const FREQUENCY: &str = "frequency";
    pub const TEMPERATURE: &str = "temperature";
    pub const UPTIME: &str = "uptime";
    pub const GRID_STATUS: &str = "gridStatus";
    pub const PHASE_STATUS: &str = "phaseStatus";
    pub const PHASE_A_AMPS: &str = "phaseA_Amps";
    pub const PHASE_B_AMPS: &str = "phaseB_Amps";
    pub const PHASE_IMBALANCE: &str = "phaseImbalance";
    pub const LOAD_PERCENT: &str = "loadPercent";
    pub const CONTINUOUS_RUNTIME: &str = "continuousRuntime";
    pub const DAILY_ACTIVE_TIME: &str = "dailyActiveTime";
    pub const HOURS_SINCE_LAST_RUN: &str = "hoursSinceLastRun";
    pub const LOWEST_DAILY_WATTS: &str = "lowestDailyWatts";
}

/// Which device representation an attribute belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Aggregate,
    Channel(ChannelIndex),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
    /// The attribute no longer has a value (e.g. after rollover).
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub target: Target,
    pub name: &'static str,
    pub value: AttributeValue,
    pub unit: Option<&'static str>,
}

impl Attribute {
    pub fn number(&self) -> Option<f64> {
        match self.value {
            AttributeValue::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// First sample seen for a channel; the representation layer should create it.
    ChannelDiscovered { index: ChannelIndex, label: String },
    Attribute(Attribute),
}

/// A batch of events produced by one engine operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub at: DateTime<Utc>,
    pub events: Vec<Event>,
}

/// Unit shown next to each numeric attribute.
pub fn unit_for(name: &str) -> Option<&'static str> {
    match name {
        names::POWER | names::LOWEST_DAILY_WATTS => Some("W"),
        names::ENERGY => Some("kWh"),
        names::AMPERAGE | names::PHASE_A_AMPS | names::PHASE_B_AMPS => Some("A"),
        names::VOLTAGE => Some("V"),
        names::FREQUENCY => Some("Hz"),
        names::LOAD_PERCENT | names::PHASE_IMBALANCE => Some("%"),
        names::CONTINUOUS_RUNTIME | names::DAILY_ACTIVE_TIME => Some("min"),
        names::HOURS_SINCE_LAST_RUN => Some("hrs"),
        _ => None,
    }
}

/// Rounds half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
