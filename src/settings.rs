//! Typed configuration snapshot consumed by the engine.
//!
//! Resolved once per configuration change from the raw YAML sections.
//! List entries that fail to parse fall back to 0 instead of rejecting
//! the whole list.

use crate::attribute::{names, ChannelIndex};
use crate::config::{
    ChangeConfig, ChannelsConfig, Config, ImbalanceSetting, TemperatureUnit, ThresholdsConfig,
};
use chrono::Duration;
use std::collections::BTreeSet;
use tracing::warn;

/// Change threshold for energy, finer than the configurable ones.
pub const ENERGY_CHANGE: f64 = 0.001;
/// Change threshold for percentages and minute counters.
pub const GENERAL_CHANGE: f64 = 0.1;
/// Change threshold for the hours-since-last-run counter.
pub const HOURS_CHANGE: f64 = 0.01;

const MAX_PASS_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeThresholds {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub frequency: f64,
    pub temperature: f64,
}

impl From<&ChangeConfig> for ChangeThresholds {
    fn from(c: &ChangeConfig) -> Self {
        Self {
            voltage: c.voltage,
            current: c.current,
            power: c.power,
            frequency: c.frequency,
            temperature: c.temperature,
        }
    }
}

impl ChangeThresholds {
    /// Minimum delta before `name` is re-emitted.
    pub fn for_attribute(&self, name: &str) -> f64 {
        match name {
            names::POWER | names::LOWEST_DAILY_WATTS => self.power,
            names::AMPERAGE | names::PHASE_A_AMPS | names::PHASE_B_AMPS => self.current,
            names::VOLTAGE => self.voltage,
            names::FREQUENCY => self.frequency,
            names::TEMPERATURE => self.temperature,
            names::ENERGY => ENERGY_CHANGE,
            names::HOURS_SINCE_LAST_RUN => HOURS_CHANGE,
            _ => GENERAL_CHANGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub channel_names: Vec<String>,
    pub breaker_amps: Vec<f64>,
    pub phase_a: BTreeSet<ChannelIndex>,
    pub phase_b: BTreeSet<ChannelIndex>,
    /// `None` disables phase monitoring.
    pub imbalance_threshold: Option<f64>,
    pub voltage_low: f64,
    pub voltage_high: f64,
    pub active_threshold_watts: f64,
    pub min_pass_interval: Duration,
    pub change: ChangeThresholds,
    pub temperature_unit: TemperatureUnit,
}

impl Default for Settings {
    fn default() -> Self {
        Self::resolve(
            &ChannelsConfig::default(),
            &ThresholdsConfig::default(),
            TemperatureUnit::default(),
        )
    }
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self::resolve(&cfg.channels, &cfg.thresholds, cfg.temperature_unit)
    }

    pub fn resolve(
        channels: &ChannelsConfig,
        thresholds: &ThresholdsConfig,
        temperature_unit: TemperatureUnit,
    ) -> Self {
        let phase_a = parse_index_list(&channels.phase_a);
        let mut phase_b = parse_index_list(&channels.phase_b);
        let overlap: Vec<ChannelIndex> = phase_a.intersection(&phase_b).copied().collect();
        if !overlap.is_empty() {
            warn!(channels = ?overlap, "channels listed on both phases; keeping them on phase A");
            for index in &overlap {
                phase_b.remove(index);
            }
        }

        Self {
            channel_names: channels.names.clone(),
            breaker_amps: parse_number_list(&channels.breaker_amps),
            phase_a,
            phase_b,
            imbalance_threshold: resolve_imbalance(&thresholds.phase_imbalance),
            voltage_low: thresholds.voltage_low,
            voltage_high: thresholds.voltage_high,
            active_threshold_watts: thresholds.appliance_on_watts,
            min_pass_interval: Duration::seconds(
                thresholds.min_pass_interval_secs.min(MAX_PASS_INTERVAL_SECS) as i64,
            ),
            change: ChangeThresholds::from(&thresholds.change),
            temperature_unit,
        }
    }

    pub fn phase_monitoring(&self) -> bool {
        self.imbalance_threshold.is_some()
    }

    pub fn phase_of(&self, index: ChannelIndex) -> Option<Phase> {
        if self.phase_a.contains(&index) {
            Some(Phase::A)
        } else if self.phase_b.contains(&index) {
            Some(Phase::B)
        } else {
            None
        }
    }

    /// Breaker rating for a channel, `None` when unmonitored.
    pub fn breaker_amps(&self, index: ChannelIndex) -> Option<f64> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.breaker_amps.get(slot).copied().filter(|a| *a > 0.0)
    }

    pub fn channel_label(&self, index: ChannelIndex) -> String {
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|slot| self.channel_names.get(slot))
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Channel {index}"))
    }
}

/// "20, 15,abc,30" -> [20, 15, 0, 30]
pub fn parse_number_list(raw: &str) -> Vec<f64> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|entry| {
            let entry = entry.trim();
            entry.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or_else(|| {
                if !entry.is_empty() {
                    warn!(entry, "ignoring malformed numeric list entry");
                }
                0.0
            })
        })
        .collect()
}

/// "1,3,x" -> {1, 3}. Malformed entries become 0, which is never a channel.
pub fn parse_index_list(raw: &str) -> BTreeSet<ChannelIndex> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<ChannelIndex>().unwrap_or_else(|_| {
                warn!(entry, "ignoring malformed channel index");
                0
            })
        })
        .filter(|index| *index > 0)
        .collect()
}

fn resolve_imbalance(setting: &ImbalanceSetting) -> Option<f64> {
    match setting {
        ImbalanceSetting::Percent(p) if p.is_finite() => Some(*p),
        ImbalanceSetting::Percent(_) => None,
        ImbalanceSetting::Keyword(word) => {
            let word = word.trim();
            match word.to_ascii_lowercase().as_str() {
                "" | "disabled" | "disable" | "off" | "none" => None,
                _ => word.parse::<f64>().ok().filter(|p| p.is_finite()).or_else(|| {
                    warn!(value = word, "unrecognised phase_imbalance; phase monitoring disabled");
                    None
                }),
            }
        }
    }
}
