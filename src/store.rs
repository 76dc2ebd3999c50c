//! Latest raw readings and derived per-channel state.

use crate::attribute::ChannelIndex;
use crate::sample::Quantity;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
    pub power: f64,
    pub current: f64,
    /// Cumulative kWh as reported by the device. Drops to ~0 when it reboots.
    pub energy_raw: f64,
    pub energy_offset: f64,
    /// Smallest positive draw since the last rollover.
    pub lowest_watts: Option<f64>,
    pub active_since: Option<DateTime<Utc>>,
    pub daily_active_minutes: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ChannelState {
    pub fn set(&mut self, quantity: Quantity, value: f64) {
        let value = value.abs();
        match quantity {
            Quantity::Power => self.power = value,
            Quantity::Current => self.current = value,
            Quantity::Energy => self.energy_raw = value,
        }
    }

    /// Resets the offset when the hardware counter went backwards.
    /// Returns true if it had to.
    pub fn heal_energy_offset(&mut self) -> bool {
        if self.energy_offset > self.energy_raw {
            self.energy_offset = 0.0;
            true
        } else {
            false
        }
    }

    pub fn daily_energy(&self) -> f64 {
        (self.energy_raw - self.energy_offset).max(0.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelStore {
    channels: BTreeMap<ChannelIndex, ChannelState>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single creation point for channels. The flag is true when the
    /// channel did not exist before this call.
    pub fn entry(&mut self, index: ChannelIndex) -> (&mut ChannelState, bool) {
        let created = !self.channels.contains_key(&index);
        (self.channels.entry(index).or_default(), created)
    }

    pub fn get(&self, index: ChannelIndex) -> Option<&ChannelState> {
        self.channels.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelIndex, &ChannelState)> {
        self.channels.iter().map(|(i, c)| (*i, c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelIndex, &mut ChannelState)> {
        self.channels.iter_mut().map(|(i, c)| (*i, c))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Makes future daily energy restart near zero.
    pub fn snapshot_energy_offsets(&mut self) {
        for channel in self.channels.values_mut() {
            channel.energy_offset = channel.energy_raw;
        }
    }

    /// Clears the vampire minimum and duty accumulator of every channel.
    pub fn clear_daily_accumulators(&mut self) {
        for channel in self.channels.values_mut() {
            channel.lowest_watts = None;
            channel.daily_active_minutes = 0.0;
        }
    }
}
