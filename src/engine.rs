//! Derived-metrics synchronization engine.
//!
//! Owns the channel store, the gates and the grid/phase state. Every public
//! operation takes the current time and returns the events it produced, so
//! callers decide how and where to publish them.

use crate::attribute::{
    names, round_to, unit_for, Attribute, AttributeValue, ChannelIndex, Event, Target,
};
use crate::gate::{IntervalGate, MagnitudeGate, SYSTEM_SYNC};
use crate::health::{evaluate_grid, evaluate_phase, GridStatus, PhaseStatus};
use crate::sample::{classify, Sample, SampleKind};
use crate::settings::{ChangeThresholds, Phase, Settings};
use crate::store::{ChannelState, ChannelStore};
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

/// Aggregates computed by the most recent pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub power: f64,
    pub energy: f64,
    pub current: f64,
    pub phase_a_amps: f64,
    pub phase_b_amps: f64,
    pub imbalance_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub totals: Totals,
    pub grid_status: GridStatus,
    pub phase_status: PhaseStatus,
    pub channels: Vec<(ChannelIndex, ChannelState)>,
    pub last_pass_at: Option<DateTime<Utc>>,
}

pub struct Engine {
    settings: Settings,
    channels: ChannelStore,
    intervals: IntervalGate,
    magnitudes: MagnitudeGate,
    grid_status: GridStatus,
    phase_status: PhaseStatus,
    last_pass_at: Option<DateTime<Utc>>,
    totals: Totals,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            channels: ChannelStore::new(),
            intervals: IntervalGate::default(),
            magnitudes: MagnitudeGate::default(),
            grid_status: GridStatus::Normal,
            phase_status: PhaseStatus::Balanced,
            last_pass_at: None,
            totals: Totals::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Takes effect from the next sample or pass.
    pub fn apply_settings(&mut self, settings: Settings) {
        if settings != self.settings {
            info!(
                phase_monitoring = settings.phase_monitoring(),
                min_pass_interval_secs = settings.min_pass_interval.num_seconds(),
                "engine settings updated"
            );
        }
        self.settings = settings;
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn grid_status(&self) -> GridStatus {
        self.grid_status
    }

    pub fn phase_status(&self) -> PhaseStatus {
        self.phase_status
    }

    pub fn channel(&self, index: ChannelIndex) -> Option<&ChannelState> {
        self.channels.get(index)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            totals: self.totals,
            grid_status: self.grid_status,
            phase_status: self.phase_status,
            channels: self.channels.iter().map(|(i, c)| (i, c.clone())).collect(),
            last_pass_at: self.last_pass_at,
        }
    }

    /// Route one decoded sample. Samples that cannot be used are dropped.
    pub fn ingest(&mut self, sample: &Sample, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = Vec::new();
        let kind = classify(&sample.id);

        if kind == SampleKind::Uptime {
            match sample.text() {
                Some(text) => events.push(Event::Attribute(Attribute {
                    target: Target::Aggregate,
                    name: names::UPTIME,
                    value: AttributeValue::Text(text),
                    unit: None,
                })),
                None => debug!(id = %sample.id, "uptime sample without state"),
            }
            return events;
        }
        if kind == SampleKind::Unknown {
            trace!(id = %sample.id, "ignoring unrecognised sample");
            return events;
        }

        let Some(value) = sample.value.as_number() else {
            debug!(id = %sample.id, value = ?sample.value, "dropping non-numeric sample");
            return events;
        };

        match kind {
            SampleKind::Voltage => {
                self.check_grid(value, &mut events);
                self.submit_scalar(names::VOLTAGE, value, None, now, &mut events);
            }
            SampleKind::Frequency => {
                self.submit_scalar(names::FREQUENCY, value, None, now, &mut events);
            }
            SampleKind::Temperature => {
                let unit = self.settings.temperature_unit;
                self.submit_scalar(
                    names::TEMPERATURE,
                    unit.from_celsius(value),
                    Some(unit.symbol()),
                    now,
                    &mut events,
                );
            }
            SampleKind::ChannelMetric { quantity, index } => {
                let (channel, created) = self.channels.entry(index);
                channel.set(quantity, value);
                if created {
                    let label = self.settings.channel_label(index);
                    info!(channel = index, label = %label, "discovered channel");
                    events.push(Event::ChannelDiscovered { index, label });
                }
                events.extend(self.run_pass(now));
            }
            SampleKind::Uptime | SampleKind::Unknown => {}
        }
        events
    }

    /// Run a pass unless one ran less than the minimum interval ago.
    pub fn run_pass(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        if !self
            .intervals
            .allow(SYSTEM_SYNC, now, self.settings.min_pass_interval)
        {
            trace!("pass suppressed by interval gate");
            return Vec::new();
        }
        self.pass(now)
    }

    /// Run a pass regardless of the interval gate.
    pub fn force_pass(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        self.pass(now)
    }

    /// Day boundary: restart daily energy, clear vampire minimums and duty
    /// accumulators, reset the rate-limit registry and publish immediately.
    pub fn rollover(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        info!(channels = self.channels.len(), "daily rollover");
        self.channels.snapshot_energy_offsets();
        self.channels.clear_daily_accumulators();
        self.intervals.clear();

        let mut events = Vec::new();
        for (index, _) in self.channels.iter() {
            let target = Target::Channel(index);
            self.magnitudes.forget(target, names::LOWEST_DAILY_WATTS);
            events.push(Event::Attribute(Attribute {
                target,
                name: names::LOWEST_DAILY_WATTS,
                value: AttributeValue::Cleared,
                unit: unit_for(names::LOWEST_DAILY_WATTS),
            }));
            let zero = self.magnitudes.record(target, names::DAILY_ACTIVE_TIME, 0.0);
            events.push(Event::Attribute(Attribute {
                target,
                name: names::DAILY_ACTIVE_TIME,
                value: AttributeValue::Number(zero),
                unit: unit_for(names::DAILY_ACTIVE_TIME),
            }));
        }
        events.extend(self.force_pass(now));
        events
    }

    /// Restart daily energy without touching the vampire or duty accumulators.
    pub fn reset_daily_energy(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        info!(channels = self.channels.len(), "resetting daily energy");
        self.channels.snapshot_energy_offsets();
        self.force_pass(now)
    }

    fn check_grid(&mut self, voltage: f64, events: &mut Vec<Event>) {
        let status = evaluate_grid(
            voltage,
            self.settings.voltage_low,
            self.settings.voltage_high,
        );
        if status == self.grid_status {
            return;
        }
        match status {
            GridStatus::Normal => info!(
                voltage,
                previous = %self.grid_status,
                "grid voltage back to normal"
            ),
            _ => warn!(voltage, status = %status, "grid voltage alert"),
        }
        self.grid_status = status;
        events.push(status_event(names::GRID_STATUS, status.to_string()));
    }

    /// Global scalar: interval gate keyed by the metric, then the magnitude gate.
    fn submit_scalar(
        &mut self,
        name: &'static str,
        value: f64,
        unit: Option<&'static str>,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        if !self
            .intervals
            .allow(name, now, self.settings.min_pass_interval)
        {
            return;
        }
        let threshold = self.settings.change.for_attribute(name);
        if let Some(rounded) = self
            .magnitudes
            .check(Target::Aggregate, name, value, threshold)
        {
            events.push(Event::Attribute(Attribute {
                target: Target::Aggregate,
                name,
                value: AttributeValue::Number(rounded),
                unit: unit.or_else(|| unit_for(name)),
            }));
        }
    }

    fn pass(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let delta_minutes = self
            .last_pass_at
            .map(|last| minutes_between(last, now).max(0.0))
            .unwrap_or(0.0);
        self.last_pass_at = Some(now);

        let Self {
            settings,
            channels,
            magnitudes,
            phase_status,
            totals,
            ..
        } = self;

        let mut events = Vec::new();
        let mut sums = Totals::default();
        {
            let mut emit = Emitter {
                gate: magnitudes,
                change: &settings.change,
                events: &mut events,
            };

            for (index, channel) in channels.iter_mut() {
                sync_channel(index, channel, settings, now, delta_minutes, &mut sums, &mut emit);
            }

            emit.gated(Target::Aggregate, names::POWER, sums.power);
            emit.gated(Target::Aggregate, names::ENERGY, sums.energy);
            emit.gated(Target::Aggregate, names::AMPERAGE, sums.current);

            match settings.imbalance_threshold {
                Some(threshold) => {
                    let balance = evaluate_phase(sums.phase_a_amps, sums.phase_b_amps, threshold);
                    sums.imbalance_pct = balance.imbalance_pct;
                    emit.gated(Target::Aggregate, names::PHASE_A_AMPS, sums.phase_a_amps);
                    emit.gated(Target::Aggregate, names::PHASE_B_AMPS, sums.phase_b_amps);
                    emit.gated(Target::Aggregate, names::PHASE_IMBALANCE, balance.imbalance_pct);
                    if balance.status != *phase_status {
                        if balance.status == PhaseStatus::Warning {
                            warn!(
                                phase_a_amps = sums.phase_a_amps,
                                phase_b_amps = sums.phase_b_amps,
                                imbalance_pct = balance.imbalance_pct,
                                threshold,
                                "split-phase load imbalance"
                            );
                        }
                        *phase_status = balance.status;
                        emit.status(names::PHASE_STATUS, balance.status.to_string());
                    }
                }
                None => {
                    if *phase_status != PhaseStatus::Disabled {
                        *phase_status = PhaseStatus::Disabled;
                        emit.status(names::PHASE_STATUS, PhaseStatus::Disabled.to_string());
                    }
                }
            }
        }
        *totals = sums;

        debug!(
            channels = channels.len(),
            power = sums.power,
            energy = sums.energy,
            current = sums.current,
            events = events.len(),
            "pass complete"
        );
        events
    }
}

fn sync_channel(
    index: ChannelIndex,
    ch: &mut ChannelState,
    settings: &Settings,
    now: DateTime<Utc>,
    delta_minutes: f64,
    sums: &mut Totals,
    emit: &mut Emitter<'_>,
) {
    let target = Target::Channel(index);

    if ch.heal_energy_offset() {
        info!(
            channel = index,
            energy_raw = ch.energy_raw,
            "energy counter went backwards; daily baseline reset"
        );
    }
    let daily_energy = ch.daily_energy();

    sums.power += ch.power;
    sums.energy += daily_energy;
    sums.current += ch.current;
    if settings.phase_monitoring() {
        match settings.phase_of(index) {
            Some(Phase::A) => sums.phase_a_amps += ch.current,
            Some(Phase::B) => sums.phase_b_amps += ch.current,
            None => {}
        }
    }

    if ch.power > 0.0 && ch.lowest_watts.map_or(true, |lowest| ch.power < lowest) {
        ch.lowest_watts = Some(ch.power);
        emit.forced(target, names::LOWEST_DAILY_WATTS, ch.power);
    }

    if ch.power >= settings.active_threshold_watts {
        // A start time in the future means the clock stepped back; restart the run.
        if ch.active_since.map_or(true, |since| since > now) {
            ch.active_since = Some(now);
        }
        let since = ch.active_since.unwrap_or(now);
        emit.gated(
            target,
            names::CONTINUOUS_RUNTIME,
            round_to(minutes_between(since, now), 1),
        );
        ch.daily_active_minutes += delta_minutes;
        ch.last_run_at = Some(now);
        emit.gated(target, names::HOURS_SINCE_LAST_RUN, 0.0);
    } else {
        if ch.active_since.take().is_some() {
            emit.forced(target, names::CONTINUOUS_RUNTIME, 0.0);
        }
        if let Some(last_run) = ch.last_run_at {
            emit.gated(
                target,
                names::HOURS_SINCE_LAST_RUN,
                round_to(minutes_between(last_run, now).max(0.0) / 60.0, 2),
            );
        }
    }
    if ch.daily_active_minutes > 0.0 {
        emit.gated(
            target,
            names::DAILY_ACTIVE_TIME,
            round_to(ch.daily_active_minutes, 1),
        );
    }

    if let Some(breaker_amps) = settings.breaker_amps(index) {
        emit.gated(target, names::LOAD_PERCENT, ch.current / breaker_amps * 100.0);
    }

    emit.gated(target, names::POWER, ch.power);
    emit.gated(target, names::ENERGY, daily_energy);
    emit.gated(target, names::AMPERAGE, ch.current);
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

fn status_event(name: &'static str, status: String) -> Event {
    Event::Attribute(Attribute {
        target: Target::Aggregate,
        name,
        value: AttributeValue::Text(status),
        unit: None,
    })
}

/// Collects the events of one pass through the magnitude gate.
struct Emitter<'a> {
    gate: &'a mut MagnitudeGate,
    change: &'a ChangeThresholds,
    events: &'a mut Vec<Event>,
}

impl Emitter<'_> {
    fn gated(&mut self, target: Target, name: &'static str, value: f64) {
        let threshold = self.change.for_attribute(name);
        if let Some(rounded) = self.gate.check(target, name, value, threshold) {
            self.push(target, name, rounded);
        }
    }

    fn forced(&mut self, target: Target, name: &'static str, value: f64) {
        let rounded = self.gate.record(target, name, value);
        self.push(target, name, rounded);
    }

    fn status(&mut self, name: &'static str, status: String) {
        self.events.push(status_event(name, status));
    }

    fn push(&mut self, target: Target, name: &'static str, value: f64) {
        self.events.push(Event::Attribute(Attribute {
            target,
            name,
            value: AttributeValue::Number(value),
            unit: unit_for(name),
        }));
    }
}
