//! Gateway configuration.
//!
//! Configuration is read once at startup from a YAML file, then environment
//! overrides are applied on top:
//!
//! | Variable | Field |
//! |---|---|
//! | `MODBUS_RESPONSE_TIMEOUT_MS` | `response_timeout_ms` |
//! | `MODBUS_INTERFRAME_DELAY_MS` | `inter_frame_delay_ms` |
//! | `MODBUS_MAX_RETRIES` | `max_retries` |
//! | `MODBUS_PACKET_LOGGING` | `packet_logging` |
//!
//! A timing override that is not a number, is `<= 0`, or is at or beyond
//! [`MAX_STACK_PARAM_MS`] leaves the previous value in place.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::directory::PointConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::FrameFormat;
use crate::logging::LoggingMode;

/// Default response timeout (ms)
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 80;

/// Default inter-frame delay (ms)
pub const DEFAULT_INTERFRAME_DELAY_MS: u64 = 0;

/// Upper bound (exclusive) for timing parameters in ms
pub const MAX_STACK_PARAM_MS: i64 = 60_000;

/// Default number of Request Table slots
pub const DEFAULT_MAX_REQUESTS_IN_FLIGHT: usize = 1000;

/// Timing parameters of the dispatch stack, held in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub response_timeout_us: u64,
    pub inter_frame_delay_us: u64,
    /// Retries after the first timeout
    pub max_retries: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            response_timeout_us: DEFAULT_RESPONSE_TIMEOUT_MS * 1000,
            inter_frame_delay_us: DEFAULT_INTERFRAME_DELAY_MS * 1000,
            max_retries: 0,
        }
    }
}

impl StackConfig {
    /// Build from millisecond values; out-of-range values keep the defaults
    pub fn from_millis(response_timeout_ms: i64, inter_frame_delay_ms: i64) -> Self {
        Self::default().with_millis(response_timeout_ms, inter_frame_delay_ms)
    }

    /// Overlay millisecond values; out-of-range values keep the current ones
    pub fn with_millis(mut self, response_timeout_ms: i64, inter_frame_delay_ms: i64) -> Self {
        if valid_stack_param(response_timeout_ms) {
            self.response_timeout_us = response_timeout_ms as u64 * 1000;
        }
        if valid_stack_param(inter_frame_delay_ms) {
            self.inter_frame_delay_us = inter_frame_delay_ms as u64 * 1000;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_micros(self.response_timeout_us)
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_micros(self.inter_frame_delay_us)
    }
}

fn valid_stack_param(value_ms: i64) -> bool {
    value_ms > 0 && value_ms < MAX_STACK_PARAM_MS
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line settings for RTU mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    /// Silent interval of 3.5 character times (11 bits per character)
    pub fn frame_gap(&self) -> Duration {
        let char_time_us = 11_000_000 / self.baud_rate.max(1) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: FrameFormat,
    pub response_timeout_ms: u64,
    /// `None` derives the delay from the mode (0 for TCP, 3.5 chars for RTU)
    pub inter_frame_delay_ms: Option<u64>,
    pub max_retries: u32,
    pub max_requests_in_flight: usize,
    pub write_workers: usize,
    pub response_workers: usize,
    pub write_queue_capacity: usize,
    pub packet_logging: bool,
    pub logging_mode: LoggingMode,
    pub log_level: String,
    pub serial: SerialSettings,
    pub points: Vec<PointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: FrameFormat::Tcp,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            inter_frame_delay_ms: None,
            max_retries: 0,
            max_requests_in_flight: DEFAULT_MAX_REQUESTS_IN_FLIGHT,
            write_workers: 1,
            response_workers: 1,
            write_queue_capacity: 1024,
            packet_logging: false,
            logging_mode: LoggingMode::Interpreted,
            log_level: "info".to_string(),
            serial: SerialSettings::default(),
            points: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&text)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MODBUS_RESPONSE_TIMEOUT_MS") {
            match value.trim().parse::<i64>() {
                Ok(ms) if valid_stack_param(ms) => self.response_timeout_ms = ms as u64,
                _ => warn!("Ignoring MODBUS_RESPONSE_TIMEOUT_MS={}", value),
            }
        }
        if let Some(value) = lookup("MODBUS_INTERFRAME_DELAY_MS") {
            match value.trim().parse::<i64>() {
                Ok(ms) if valid_stack_param(ms) => self.inter_frame_delay_ms = Some(ms as u64),
                _ => warn!("Ignoring MODBUS_INTERFRAME_DELAY_MS={}", value),
            }
        }
        if let Some(value) = lookup("MODBUS_MAX_RETRIES") {
            match value.trim().parse::<u32>() {
                Ok(retries) => self.max_retries = retries,
                Err(_) => warn!("Ignoring MODBUS_MAX_RETRIES={}", value),
            }
        }
        if let Some(value) = lookup("MODBUS_PACKET_LOGGING") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.packet_logging = true,
                "0" | "false" | "no" | "off" => self.packet_logging = false,
                _ => warn!("Ignoring MODBUS_PACKET_LOGGING={}", value),
            }
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.max_requests_in_flight == 0 || self.max_requests_in_flight >= u16::MAX as usize {
            return Err(ModbusError::configuration(format!(
                "max_requests_in_flight must be 1..{}, got {}",
                u16::MAX,
                self.max_requests_in_flight
            )));
        }
        if self.write_workers == 0 || self.response_workers == 0 {
            return Err(ModbusError::configuration("worker counts must be at least 1"));
        }
        if self.mode == FrameFormat::Rtu && self.serial.baud_rate == 0 {
            return Err(ModbusError::configuration("serial baud_rate must be non-zero"));
        }
        for point in &self.points {
            point.validate(self.mode)?;
        }
        Ok(())
    }

    /// Effective inter-frame delay in ms
    pub fn effective_inter_frame_delay_ms(&self) -> u64 {
        match (self.inter_frame_delay_ms, self.mode) {
            (Some(ms), _) => ms,
            (None, FrameFormat::Tcp) => DEFAULT_INTERFRAME_DELAY_MS,
            (None, FrameFormat::Rtu) => (self.serial.frame_gap().as_micros() as u64).div_ceil(1000),
        }
    }

    /// Stack timing derived from this configuration
    pub fn stack_config(&self) -> StackConfig {
        StackConfig::from_millis(
            self.response_timeout_ms as i64,
            self.effective_inter_frame_delay_ms() as i64,
        )
        .with_max_retries(self.max_retries)
    }
}
