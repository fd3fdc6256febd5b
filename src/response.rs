//! Response Processor.
//!
//! Completed stack responses are pushed onto a work queue by the completion
//! handler and turned into [`PointResult`]s by worker tasks. A response whose
//! reference id has no pending record is an orphan and is dropped.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::directory::{DataType, PointConfig};
use crate::error::{CompletionStatus, ModbusError, ModbusResult, StackStatus};
use crate::initiator::{PendingKind, PendingRequest, PendingTable};
use crate::manager::{CompletionHandler, StackResponse};
use crate::queue::{Shutdown, WorkQueue};
use crate::utils::{fit_to_len, parse_hex_string, split_timestamp, to_hex_string};

/// Outcome carried by a published result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Good,
    /// The device answered with an exception code
    Exception,
    Timeout,
    /// Previous read of the point is still outstanding
    NoResponse,
    /// Transport failure, shutdown, or a request the stack refused
    Failed,
}

/// Scaled representation of a point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaledValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

/// Result object handed to the publisher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResult {
    pub point: String,
    pub wellhead: String,
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_seq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_topic: Option<String>,
    /// Raw value as `0x`-prefixed hex, empty when there is none
    pub value: String,
    pub scaled_value: Option<ScaledValue>,
    pub data_type: DataType,
    pub status: ResultStatus,
    /// Modbus exception code, 0 if none
    pub exception_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    pub usec: u32,
    pub transaction_id: u16,
    pub is_on_demand: bool,
}

impl PointResult {
    fn blank(point: &PointConfig, status: ResultStatus) -> Self {
        let (timestamp, usec) = split_timestamp(Utc::now());
        Self {
            point: point.key(),
            wellhead: point.wellhead.clone(),
            metric: point.metric.clone(),
            version: None,
            app_seq: None,
            source_topic: None,
            value: String::new(),
            scaled_value: None,
            data_type: point.data_type,
            status,
            exception_code: 0,
            error: None,
            timestamp,
            usec,
            transaction_id: 0,
            is_on_demand: false,
        }
    }

    fn for_request(request: &PendingRequest, status: ResultStatus) -> Self {
        Self {
            version: request.version.clone(),
            app_seq: request.app_seq.clone(),
            source_topic: request.source_topic.clone(),
            is_on_demand: request.is_on_demand(),
            ..Self::blank(&request.point, status)
        }
    }

    /// Placeholder for a cycle skipped because the point is still awaiting
    pub fn no_response(point: &PointConfig) -> Self {
        Self {
            error: Some("previous request still awaiting response".to_string()),
            ..Self::blank(point, ResultStatus::NoResponse)
        }
    }

    /// Result for a request the stack refused synchronously
    pub fn rejected(request: &PendingRequest, status: StackStatus) -> Self {
        Self {
            error: Some(status.to_string()),
            ..Self::for_request(request, ResultStatus::Failed)
        }
    }
}

/// Receives every result produced by the gateway
pub trait ResultPublisher: Send + Sync {
    fn publish(&self, result: PointResult);
}

impl<F> ResultPublisher for F
where
    F: Fn(PointResult) + Send + Sync,
{
    fn publish(&self, result: PointResult) {
        self(result)
    }
}

/// Render response data for a point.
///
/// Register data is inverse-swapped into big-endian value order. Bit data is
/// rendered as the packed bytes.
pub fn format_value(point: &PointConfig, data: &[u8]) -> String {
    let swap = point.swap();
    if point.register_type.is_bit() || swap.is_identity() {
        return to_hex_string(data);
    }
    to_hex_string(&swap.invert(data))
}

/// Interpret a hex value per declared type and width and apply the scale
/// factor.
///
/// `width` is in registers: int/uint widths 1, 2 and 4 are 16, 32 and 64 bit,
/// float needs width 2 and double width 4. Integer results are truncated
/// toward zero.
pub fn set_scaled_value(hex: &str, data_type: DataType, scale: f64, width: u16) -> ModbusResult<ScaledValue> {
    let bytes = parse_hex_string(hex)?;
    let bad_width = || ModbusError::invalid_data(format!("width {} not valid for {}", width, data_type));

    let value = match data_type {
        DataType::Boolean => ScaledValue::Bool(bytes.iter().any(|b| *b != 0)),
        DataType::Int => {
            let raw = fit_to_len(&bytes, width as usize * 2);
            let value = match width {
                1 => i16::from_be_bytes([raw[0], raw[1]]) as f64,
                2 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
                4 => i64::from_be_bytes(raw[..8].try_into().map_err(|_| bad_width())?) as f64,
                _ => return Err(bad_width()),
            };
            ScaledValue::Int((value * scale).trunc() as i64)
        }
        DataType::Uint => {
            let raw = fit_to_len(&bytes, width as usize * 2);
            let value = match width {
                1 => u16::from_be_bytes([raw[0], raw[1]]) as f64,
                2 => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
                4 => u64::from_be_bytes(raw[..8].try_into().map_err(|_| bad_width())?) as f64,
                _ => return Err(bad_width()),
            };
            ScaledValue::Uint((value * scale).trunc() as u64)
        }
        DataType::Float => {
            if width != 2 {
                return Err(bad_width());
            }
            let raw = fit_to_len(&bytes, 4);
            let value = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64;
            ScaledValue::Float(value * scale)
        }
        DataType::Double => {
            if width != 4 {
                return Err(bad_width());
            }
            let raw = fit_to_len(&bytes, 8);
            let value = f64::from_be_bytes(raw[..8].try_into().map_err(|_| bad_width())?);
            ScaledValue::Float(value * scale)
        }
        DataType::String => {
            let text = String::from_utf8_lossy(&bytes);
            ScaledValue::Text(text.trim_end_matches('\0').to_string())
        }
    };
    Ok(value)
}

/// Consumes completed stack responses and publishes point results
pub struct ResponseProcessor {
    pending: Arc<PendingTable>,
    publisher: Arc<dyn ResultPublisher>,
    queue: WorkQueue<StackResponse>,
}

impl ResponseProcessor {
    pub fn new(pending: Arc<PendingTable>, publisher: Arc<dyn ResultPublisher>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pending,
            publisher,
            queue: WorkQueue::new(capacity),
        })
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Completion handler that feeds this processor.
    ///
    /// If the queue is full the response is processed on the caller's task.
    pub fn completion_handler(self: &Arc<Self>) -> Arc<dyn CompletionHandler> {
        let processor = Arc::clone(self);
        Arc::new(move |response: StackResponse| {
            if let Err(response) = processor.queue.push(response) {
                warn!("Response queue full, processing transaction {} inline", response.transaction_id);
                processor.process(response);
            }
        })
    }

    /// Spawn `count` worker tasks that run until shutdown
    pub fn spawn_workers(self: &Arc<Self>, count: usize, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let processor = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while let Some(response) = processor.queue.pop(&mut shutdown).await {
                        processor.process(response);
                    }
                    debug!("Response worker {} stopped", worker);
                })
            })
            .collect()
    }

    /// Process whatever is still queued once the workers have stopped
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Some(response) = self.queue.try_pop() {
            self.process(response);
            count += 1;
        }
        count
    }

    /// Correlate one response with its pending request and publish the result.
    ///
    /// Returns `None` for an orphan.
    pub fn process(&self, response: StackResponse) -> Option<PointResult> {
        let Some(request) = self.pending.take(response.app_transaction_id) else {
            warn!(
                "Dropping orphan response: reference {} (transaction {}) from {}",
                response.app_transaction_id, response.transaction_id, response.device
            );
            return None;
        };

        let result = build_result(&request, &response);
        if request.kind == PendingKind::Periodic {
            debug!("{} = {} ({:?})", result.point, result.value, result.status);
        }
        self.publisher.publish(result.clone());
        Some(result)
    }
}

fn build_result(request: &PendingRequest, response: &StackResponse) -> PointResult {
    let point = &request.point;
    let (timestamp, usec) = split_timestamp(response.responded_at);
    let mut result = PointResult {
        timestamp,
        usec,
        transaction_id: response.transaction_id,
        ..PointResult::for_request(request, ResultStatus::Good)
    };

    match &response.status {
        CompletionStatus::Success => {
            // Write responses echo the request; there is no value to report.
            if !response.function.is_write_function() {
                result.value = format_value(point, &response.data);
                match set_scaled_value(&result.value, point.data_type, point.scale, point.width) {
                    Ok(scaled) => result.scaled_value = Some(scaled),
                    Err(e) => warn!("Cannot scale value of {}: {}", point.key(), e),
                }
            }
        }
        CompletionStatus::Exception(code) => {
            result.status = ResultStatus::Exception;
            result.exception_code = *code;
            result.error = Some(ModbusError::exception(response.function.to_u8(), *code).to_string());
        }
        CompletionStatus::Timeout => {
            result.status = ResultStatus::Timeout;
            result.error = Some(response.status.to_string());
        }
        CompletionStatus::Shutdown | CompletionStatus::Transport(_) => {
            result.status = ResultStatus::Failed;
            result.error = Some(response.status.to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RegisterType;
    use crate::protocol::ModbusFunction;
    use crate::request_table::DeviceId;
    use std::sync::Mutex;

    fn point(width: u16, byte_swap: bool, word_swap: bool) -> Arc<PointConfig> {
        Arc::new(PointConfig {
            wellhead: "PL0".to_string(),
            device: "flowmeter".to_string(),
            metric: "Flow".to_string(),
            endpoint: None,
            unit_id: 1,
            register_type: RegisterType::Holding,
            address: 0,
            width,
            data_type: DataType::Int,
            scale: 1.0,
            byte_swap,
            word_swap,
            polling_interval_ms: Some(1000),
            priority: 1,
        })
    }

    fn response(app_id: u16, status: CompletionStatus, data: Vec<u8>) -> StackResponse {
        StackResponse {
            transaction_id: 40,
            app_transaction_id: app_id,
            function: ModbusFunction::ReadHoldingRegisters,
            device: DeviceId::serial(1),
            status,
            data,
            start_address: 0,
            quantity: 2,
            received_at: Utc::now(),
            responded_at: Utc::now(),
        }
    }

    fn processor() -> (Arc<ResponseProcessor>, Arc<Mutex<Vec<PointResult>>>) {
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let publisher: Arc<dyn ResultPublisher> = Arc::new(move |result: PointResult| {
            sink.lock().unwrap().push(result);
        });
        (ResponseProcessor::new(Arc::new(PendingTable::new()), publisher, 16), published)
    }

    #[test]
    fn test_scaled_values() {
        assert_eq!(set_scaled_value("0x12", DataType::Int, 20.0, 1).unwrap(), ScaledValue::Int(360));
        assert_eq!(set_scaled_value("0x24", DataType::Int, 20.0, 2).unwrap(), ScaledValue::Int(720));
        assert_eq!(set_scaled_value("0xFFFF", DataType::Int, 1.0, 1).unwrap(), ScaledValue::Int(-1));
        assert_eq!(set_scaled_value("0xFFFF", DataType::Uint, 0.5, 1).unwrap(), ScaledValue::Uint(32767));
        assert_eq!(set_scaled_value("0x3FC00000", DataType::Float, 2.0, 2).unwrap(), ScaledValue::Float(3.0));
        assert_eq!(set_scaled_value("0x01", DataType::Boolean, 1.0, 1).unwrap(), ScaledValue::Bool(true));
        assert_eq!(set_scaled_value("0x4F4B00", DataType::String, 1.0, 2).unwrap(), ScaledValue::Text("OK".into()));
        assert!(set_scaled_value("0x0001", DataType::Float, 1.0, 1).is_err());
        assert!(set_scaled_value("0x0001", DataType::Int, 1.0, 3).is_err());
    }

    #[test]
    fn test_format_value_inverts_swap() {
        let data = [0x22, 0x11, 0x44, 0x33];
        assert_eq!(format_value(&point(2, true, false), &data), "0x11223344");
        assert_eq!(format_value(&point(2, false, true), &data), "0x44332211");
        assert_eq!(format_value(&point(2, true, true), &data), "0x33441122");
        assert_eq!(format_value(&point(2, false, false), &data), "0x22114433");
    }

    #[test]
    fn test_orphan_dropped() {
        let (processor, published) = processor();
        let ref_id = processor.pending().register(PendingRequest::periodic(point(1, false, false))).unwrap();

        assert!(processor.process(response(ref_id + 1, CompletionStatus::Success, vec![0, 1])).is_none());
        assert!(published.lock().unwrap().is_empty());
        assert!(processor.pending().contains(ref_id));
        assert!(processor.pending().is_awaiting("PL0/flowmeter/Flow"));
    }

    #[test]
    fn test_success_clears_await_flag() {
        let (processor, published) = processor();
        let ref_id = processor.pending().register(PendingRequest::periodic(point(2, false, false))).unwrap();

        let result = processor
            .process(response(ref_id, CompletionStatus::Success, vec![0x00, 0x00, 0x00, 0x24]))
            .unwrap();
        assert_eq!(result.value, "0x00000024");
        assert_eq!(result.scaled_value, Some(ScaledValue::Int(36)));
        assert_eq!(result.status, ResultStatus::Good);
        assert_eq!(result.transaction_id, 40);
        assert!(!result.is_on_demand);
        assert!(!processor.pending().is_awaiting("PL0/flowmeter/Flow"));
        assert_eq!(published.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_exception_forwarded() {
        let (processor, _published) = processor();
        let mut request = PendingRequest::periodic(point(1, false, false));
        request.kind = PendingKind::OnDemandRead;
        request.app_seq = Some("1234".to_string());
        let ref_id = processor.pending().register(request).unwrap();

        let result = processor.process(response(ref_id, CompletionStatus::Exception(0x02), Vec::new())).unwrap();
        assert_eq!(result.status, ResultStatus::Exception);
        assert_eq!(result.exception_code, 2);
        assert!(result.error.as_deref().unwrap().contains("data address not available"));
        assert_eq!(result.app_seq.as_deref(), Some("1234"));
        assert!(result.is_on_demand);
        assert!(result.scaled_value.is_none());
    }

    #[test]
    fn test_write_echo_carries_no_value() {
        let (processor, _published) = processor();
        let mut request = PendingRequest::periodic(point(1, false, false));
        request.kind = PendingKind::OnDemandWrite;
        let ref_id = processor.pending().register(request).unwrap();

        let mut echo = response(ref_id, CompletionStatus::Success, vec![0x00, 0x14, 0x00, 0x2A]);
        echo.function = ModbusFunction::WriteSingleRegister;
        let result = processor.process(echo).unwrap();
        assert_eq!(result.status, ResultStatus::Good);
        assert!(result.value.is_empty());
        assert!(result.scaled_value.is_none());
        assert!(result.is_on_demand);
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let (processor, published) = processor();
        let trigger = crate::queue::ShutdownTrigger::new();
        let workers = processor.spawn_workers(2, &trigger.subscribe());
        let handler = processor.completion_handler();

        for _ in 0..4 {
            let mut request = PendingRequest::periodic(point(1, false, false));
            request.kind = PendingKind::OnDemandRead;
            let ref_id = processor.pending().register(request).unwrap();
            handler.complete(response(ref_id, CompletionStatus::Timeout, Vec::new()));
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while published.lock().unwrap().len() < 4 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        trigger.trigger();
        futures::future::join_all(workers).await;
        let results = published.lock().unwrap().clone();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == ResultStatus::Timeout));
    }
}
