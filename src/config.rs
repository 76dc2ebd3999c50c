use crate::error::{AppError, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub temperature_unit: TemperatureUnit,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    pub tls: Option<TlsConfig>,
}

fn default_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM CA bundle (optional)
    pub ca_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Address of the sensing hardware. Only used for logging and discovery metadata.
    #[serde(default)]
    pub address: Option<String>,
    /// Topic filter the transport publishes decoded samples on.
    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_telemetry_topic() -> String {
    "energy-sensor/telemetry".into()
}

fn default_qos() -> u8 {
    1
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            telemetry_topic: default_telemetry_topic(),
            qos: default_qos(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_retain")]
    pub retain: bool,
}

fn default_topic_prefix() -> String {
    "circuit-monitor".into()
}

fn default_retain() -> bool {
    true
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            qos: default_qos(),
            retain: default_retain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Display names, position 0 is channel 1.
    #[serde(default)]
    pub names: Vec<String>,
    /// Comma-separated breaker ratings in amps, position 0 is channel 1.
    /// "0" or a missing entry leaves the channel unmonitored.
    #[serde(default)]
    pub breaker_amps: String,
    #[serde(default = "default_phase_a")]
    pub phase_a: String,
    #[serde(default = "default_phase_b")]
    pub phase_b: String,
}

fn default_phase_a() -> String {
    "1,3,5".into()
}

fn default_phase_b() -> String {
    "2,4,6".into()
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            breaker_amps: String::new(),
            phase_a: default_phase_a(),
            phase_b: default_phase_b(),
        }
    }
}

/// Either a percentage or a keyword such as "disabled".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImbalanceSetting {
    Percent(f64),
    Keyword(String),
}

impl Default for ImbalanceSetting {
    fn default() -> Self {
        ImbalanceSetting::Percent(20.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_voltage_low")]
    pub voltage_low: f64,
    #[serde(default = "default_voltage_high")]
    pub voltage_high: f64,
    #[serde(default)]
    pub phase_imbalance: ImbalanceSetting,
    #[serde(default = "default_appliance_on_watts")]
    pub appliance_on_watts: f64,
    #[serde(default = "default_min_pass_interval_secs")]
    pub min_pass_interval_secs: u64,
    #[serde(default)]
    pub change: ChangeConfig,
}

fn default_voltage_low() -> f64 {
    114.0
}

fn default_voltage_high() -> f64 {
    126.0
}

fn default_appliance_on_watts() -> f64 {
    10.0
}

fn default_min_pass_interval_secs() -> u64 {
    5
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            voltage_low: default_voltage_low(),
            voltage_high: default_voltage_high(),
            phase_imbalance: ImbalanceSetting::default(),
            appliance_on_watts: default_appliance_on_watts(),
            min_pass_interval_secs: default_min_pass_interval_secs(),
            change: ChangeConfig::default(),
        }
    }
}

/// Minimum change before a value is re-emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfig {
    #[serde(default = "default_change")]
    pub voltage: f64,
    #[serde(default = "default_change")]
    pub current: f64,
    #[serde(default = "default_change")]
    pub power: f64,
    #[serde(default = "default_change")]
    pub frequency: f64,
    #[serde(default = "default_change")]
    pub temperature: f64,
}

fn default_change() -> f64 {
    0.1
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            voltage: default_change(),
            current: default_change(),
            power: default_change(),
            frequency: default_change(),
            temperature: default_change(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(alias = "c", alias = "celsius", alias = "Celsius")]
    C,
    #[default]
    #[serde(alias = "f", alias = "fahrenheit", alias = "Fahrenheit")]
    F,
    #[serde(alias = "k", alias = "kelvin", alias = "Kelvin")]
    K,
}

impl TemperatureUnit {
    /// Converts a Celsius reading from the device into this unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::C => celsius,
            TemperatureUnit::F => celsius * 1.8 + 32.0,
            TemperatureUnit::K => celsius + 273.15,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::C => "°C",
            TemperatureUnit::F => "°F",
            TemperatureUnit::K => "K",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock time of the daily rollover, "HH:MM".
    #[serde(default = "default_rollover_time")]
    pub rollover_time: String,
    /// Forces a pass periodically so idle-time metrics keep advancing. 0 disables.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_rollover_time() -> String {
    "00:00".into()
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rollover_time: default_rollover_time(),
            refresh_interval_secs: default_refresh_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn rollover_at(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.rollover_time.trim(), "%H:%M").map_err(|e| {
            AppError::Config(format!(
                "invalid rollover_time '{}': {}",
                self.rollover_time, e
            ))
        })
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if MQTT_HOST env is set, override `mqtt.host`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(AppError::Config("mqtt.host cannot be empty".into()));
        }
        if self.mqtt.port == 0 {
            return Err(AppError::Config("mqtt.port cannot be 0".into()));
        }
        if self.device.telemetry_topic.is_empty() {
            return Err(AppError::Config(
                "device.telemetry_topic cannot be empty".into(),
            ));
        }
        if self.thresholds.voltage_low >= self.thresholds.voltage_high {
            return Err(AppError::Config(format!(
                "voltage_low ({}) must be below voltage_high ({})",
                self.thresholds.voltage_low, self.thresholds.voltage_high
            )));
        }
        self.schedule.rollover_at()?;
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
