/// Small helpers shared across the engine: hex strings, interval
/// arithmetic, timestamps and round-trip statistics.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use crate::error::{ModbusError, ModbusResult};

/// Round-trip statistics of a device session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub orphan_responses: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a correlated response (normal or exception)
    pub fn record_success(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }

    /// Record a request that ended without a response
    pub fn record_failure(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.total_duration += duration;
    }

    pub fn avg_duration(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / self.total_requests as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }
}

/// Greatest common divisor
pub fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// GCD of every value, 0 for an empty input
pub fn gcd_all<I: IntoIterator<Item = u64>>(values: I) -> u64 {
    values.into_iter().fold(0, gcd)
}

/// Round `value` up to the next multiple of `step`
pub fn round_up_to_multiple(value: u64, step: u64) -> u64 {
    if step == 0 {
        return value;
    }
    value.div_ceil(step) * step
}

/// Render bytes as a `0x`-prefixed upper-case hex string
pub fn to_hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode_upper(bytes))
}

/// Parse a hex string with or without `0x`/`0X` prefix.
///
/// An odd number of digits is left-padded with a zero.
pub fn parse_hex_string(value: &str) -> ModbusResult<Vec<u8>> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);

    if digits.is_empty() {
        return Err(ModbusError::invalid_data(format!("Empty hex value '{}'", value)));
    }

    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{}", digits);
        padded.as_str()
    } else {
        digits
    };

    hex::decode(digits).map_err(|e| ModbusError::invalid_data(format!("Invalid hex value '{}': {}", value, e)))
}

/// Fit `bytes` into exactly `len` bytes, keeping the least significant end
pub fn fit_to_len(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        bytes[bytes.len() - len..].to_vec()
    } else {
        let mut out = vec![0u8; len - bytes.len()];
        out.extend_from_slice(bytes);
        out
    }
}

/// Split a timestamp into the `"%Y-%m-%d %H:%M:%S"` text and microseconds
pub fn split_timestamp(at: DateTime<Utc>) -> (String, u32) {
    let text = at.format("%Y-%m-%d %H:%M:%S").to_string();
    let usec = at.nanosecond() % 1_000_000_000 / 1_000;
    (text, usec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(20));
        metrics.record_failure(Duration::from_millis(30));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(10)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(20)));
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_avg_duration_past_u32_requests() {
        let metrics = PerformanceMetrics {
            total_requests: u32::MAX as u64 + 2,
            total_duration: Duration::from_secs(u32::MAX as u64 + 2),
            ..PerformanceMetrics::default()
        };
        assert_eq!(metrics.avg_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(600, 1000), 200);
        assert_eq!(gcd_all([600, 1000, 250]), 50);
        assert_eq!(gcd_all(Vec::<u64>::new()), 0);
        assert_eq!(round_up_to_multiple(130, 25), 150);
        assert_eq!(round_up_to_multiple(150, 25), 150);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(parse_hex_string("0x12").unwrap(), vec![0x12]);
        assert_eq!(parse_hex_string("0XABC").unwrap(), vec![0x0A, 0xBC]);
        assert_eq!(parse_hex_string("0024").unwrap(), vec![0x00, 0x24]);
        assert!(parse_hex_string("0x").is_err());
        assert!(parse_hex_string("zz").is_err());
        assert_eq!(to_hex_string(&[0x00, 0x2A]), "0x002A");
        assert_eq!(fit_to_len(&[0x12], 2), vec![0x00, 0x12]);
        assert_eq!(fit_to_len(&[0x01, 0x02, 0x03], 2), vec![0x02, 0x03]);
    }

    #[test]
    fn test_split_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap() + chrono::Duration::microseconds(250);
        assert_eq!(split_timestamp(at), ("2024-03-01 12:30:05".to_string(), 250));
    }
}
