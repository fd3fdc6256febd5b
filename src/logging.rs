use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{FrameFormat, MBAP_HEADER_SIZE};
use crate::protocol::ModbusFunction;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_level` when it is set. Calling this twice is
/// an error, which tests avoid by not calling it at all.
pub fn init_logging(default_level: &str) -> ModbusResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| ModbusError::configuration(format!("Invalid log level '{}': {}", default_level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| ModbusError::configuration(format!("Logging already initialised: {}", e)))
}

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show interpreted header fields
    #[default]
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

/// Frame direction relative to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "->"),
            Direction::Incoming => write!(f, "<-"),
        }
    }
}

/// Receives rendered frame lines instead of `tracing`
pub type FrameCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Renders transport frames for packet tracing.
///
/// Without a callback, lines go to `tracing` (interpreted at `info`, raw at
/// `debug` when both are shown).
#[derive(Clone)]
pub struct FrameLogger {
    callback: Option<Arc<FrameCallback>>,
    mode: LoggingMode,
}

impl FrameLogger {
    pub fn new(mode: LoggingMode) -> Self {
        Self { callback: None, mode }
    }

    pub fn with_callback(mode: LoggingMode, callback: FrameCallback) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            mode,
        }
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    fn emit(&self, line: &str, raw: bool) {
        match &self.callback {
            Some(callback) => callback(line),
            None if raw && self.mode == LoggingMode::Both => debug!("{}", line),
            None => info!("{}", line),
        }
    }

    /// Log one complete frame
    pub fn log_frame(&self, direction: Direction, format: FrameFormat, frame: &[u8]) {
        let tag = match format {
            FrameFormat::Tcp => "TCP",
            FrameFormat::Rtu => "RTU",
        };

        if matches!(self.mode, LoggingMode::Interpreted | LoggingMode::Both) {
            let line = format!("[MODBUS-{}] {} {}", tag, direction, interpret_frame(format, frame));
            self.emit(&line, false);
        }
        if matches!(self.mode, LoggingMode::Raw | LoggingMode::Both) {
            let line = format!("[MODBUS-{}] {} raw: {}", tag, direction, format_hex_packet(frame));
            self.emit(&line, true);
        }
    }
}

impl fmt::Debug for FrameLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLogger")
            .field("mode", &self.mode)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Default for FrameLogger {
    fn default() -> Self {
        Self::new(LoggingMode::Interpreted)
    }
}

/// Format raw bytes as space-separated upper-case hex
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn interpret_frame(format: FrameFormat, frame: &[u8]) -> String {
    let (transaction, pdu_start) = match format {
        FrameFormat::Tcp if frame.len() > MBAP_HEADER_SIZE + 1 => (
            format!("txn: {}, ", u16::from_be_bytes([frame[0], frame[1]])),
            MBAP_HEADER_SIZE,
        ),
        FrameFormat::Rtu if frame.len() > 3 => (String::new(), 0),
        _ => return format!("short frame: {}", hex::encode(frame)),
    };

    let unit_id = frame[pdu_start];
    let code = frame[pdu_start + 1];
    let body_end = match format {
        FrameFormat::Tcp => frame.len(),
        FrameFormat::Rtu => frame.len() - 2,
    };
    let body = &frame[(pdu_start + 2).min(body_end)..body_end];

    if code & 0x80 != 0 {
        return format!(
            "{}unit: {}, exception for 0x{:02X}: code 0x{}",
            transaction,
            unit_id,
            code & 0x7F,
            hex::encode(body)
        );
    }

    let function = ModbusFunction::from_u8(code)
        .map(|function| function.to_string())
        .unwrap_or_else(|_| format!("Unknown (0x{:02X})", code));

    format!("{}unit: {}, function: {}, data: {}", transaction, unit_id, function, hex::encode(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(mode: LoggingMode) -> (FrameLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let logger = FrameLogger::with_callback(
            mode,
            Box::new(move |line| sink.lock().unwrap().push(line.to_string())),
        );
        (logger, lines)
    }

    #[test]
    fn test_raw_mode() {
        let (logger, lines) = capture(LoggingMode::Raw);
        logger.log_frame(Direction::Outgoing, FrameFormat::Rtu, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], "[MODBUS-RTU] -> raw: 01 03 00 00 00 02 C4 0B");
    }

    #[test]
    fn test_interpreted_tcp_frame() {
        let (logger, lines) = capture(LoggingMode::Interpreted);
        logger.log_frame(
            Direction::Incoming,
            FrameFormat::Tcp,
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A],
        );
        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("txn: 5"));
        assert!(lines[0].contains("Read Holding Registers"));
        assert!(lines[0].contains("data: 02002a"));
    }

    #[test]
    fn test_both_mode_and_exception() {
        let (logger, lines) = capture(LoggingMode::Both);
        logger.log_frame(
            Direction::Incoming,
            FrameFormat::Tcp,
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02],
        );
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("exception for 0x03"));
        assert!(lines[1].contains("raw: 00 05"));
    }
}
