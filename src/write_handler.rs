//! Write Handler: on-demand writes and reads from the bus.
//!
//! Raw JSON intents are pushed onto a bounded queue and consumed by worker
//! tasks. A worker parses the intent, resolves the point it names and calls
//! the matching Request Manager operation. An intent that cannot be parsed
//! or resolved is logged and dropped; the queue is unaffected.
//!
//! An intent is a write when its `sourcetopic` contains `write`, otherwise a
//! read. The point key is `<wellhead>/<device>/<command>`, where `<device>`
//! is the text between the first and second `/` of the source topic.

use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::directory::{PointConfig, PointDirectory};
use crate::error::{ModbusError, ModbusResult, StackStatus};
use crate::initiator::{issue_read, PendingKind, PendingRequest, PendingTable};
use crate::manager::{CompletionHandler, RequestManager, RequestTarget};
use crate::protocol::data_utils::coil_value_from_text;
use crate::protocol::{ModbusFunction, COIL_ON};
use crate::queue::{Shutdown, WorkQueue};
use crate::response::{PointResult, ResultPublisher};
use crate::utils::{fit_to_len, parse_hex_string};

fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Ok(text),
        serde_json::Value::Number(number) => Ok(number.to_string()),
        other => Err(de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

/// On-demand request as received from the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntent {
    #[serde(deserialize_with = "text_or_number")]
    pub app_seq: String,
    pub command: String,
    #[serde(default)]
    pub value: Option<String>,
    pub wellhead: String,
    pub version: String,
    pub sourcetopic: String,
    pub timestamp: String,
    #[serde(deserialize_with = "text_or_number")]
    pub usec: String,
}

impl WriteIntent {
    pub fn parse(text: &str) -> ModbusResult<Self> {
        let intent: WriteIntent = serde_json::from_str(text)?;
        for (name, field) in [
            ("command", &intent.command),
            ("wellhead", &intent.wellhead),
            ("sourcetopic", &intent.sourcetopic),
        ] {
            if field.trim().is_empty() {
                return Err(ModbusError::invalid_data(format!("Intent field '{}' is empty", name)));
            }
        }
        if intent.is_write() && intent.value.is_none() {
            return Err(ModbusError::invalid_data("Write intent without 'value'"));
        }
        Ok(intent)
    }

    pub fn is_write(&self) -> bool {
        self.sourcetopic.contains("write")
    }

    /// Device segment of the source topic
    pub fn device_segment(&self) -> ModbusResult<&str> {
        let topic = self.sourcetopic.as_str();
        let start = topic
            .find('/')
            .ok_or_else(|| ModbusError::invalid_data(format!("Source topic '{}' has no device segment", topic)))?
            + 1;
        let end = topic[start..].find('/').map_or(topic.len(), |offset| start + offset);
        let segment = &topic[start..end];
        if segment.is_empty() {
            return Err(ModbusError::invalid_data(format!("Source topic '{}' has no device segment", topic)));
        }
        Ok(segment)
    }

    /// Directory key of the point this intent addresses
    pub fn point_key(&self) -> ModbusResult<String> {
        Ok(format!("{}/{}/{}", self.wellhead, self.device_segment()?, self.command))
    }
}

/// Write operation derived from a point and a textual value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SingleCoil(bool),
    SingleRegister(u16),
    MultipleCoils { quantity: u16, values: Vec<u8> },
    MultipleRegisters { quantity: u16, values: Vec<u8> },
}

impl WriteOp {
    /// Encode `value` for `point`. Register values are hex in big-endian
    /// value order and get the point's byte/word swap applied.
    pub fn encode(point: &PointConfig, value: &str) -> ModbusResult<Self> {
        let width = point.width;
        let function = point
            .register_type
            .write_function(width)
            .ok_or_else(|| ModbusError::invalid_data(format!("Point {} is read-only", point.key())))?;
        match function {
            ModbusFunction::WriteSingleCoil => Ok(WriteOp::SingleCoil(coil_value_from_text(value) == COIL_ON)),
            ModbusFunction::WriteMultipleCoils => {
                let bytes = parse_hex_string(value)?;
                Ok(WriteOp::MultipleCoils {
                    quantity: width,
                    values: fit_to_len(&bytes, (width as usize).div_ceil(8)),
                })
            }
            _ => {
                let bytes = fit_to_len(&parse_hex_string(value)?, width as usize * 2);
                let values = point.swap().apply(&bytes);
                if function == ModbusFunction::WriteSingleRegister {
                    Ok(WriteOp::SingleRegister(u16::from_be_bytes([values[0], values[1]])))
                } else {
                    Ok(WriteOp::MultipleRegisters { quantity: width, values })
                }
            }
        }
    }

    pub fn function(&self) -> ModbusFunction {
        match self {
            WriteOp::SingleCoil(_) => ModbusFunction::WriteSingleCoil,
            WriteOp::SingleRegister(_) => ModbusFunction::WriteSingleRegister,
            WriteOp::MultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            WriteOp::MultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }
}

/// Queue of raw intents plus the workers that execute them
pub struct WriteHandler {
    queue: WorkQueue<String>,
    directory: Arc<dyn PointDirectory>,
    manager: Arc<RequestManager>,
    pending: Arc<PendingTable>,
    completion: Arc<dyn CompletionHandler>,
    publisher: Arc<dyn ResultPublisher>,
}

impl WriteHandler {
    pub fn new(
        capacity: usize,
        directory: Arc<dyn PointDirectory>,
        manager: Arc<RequestManager>,
        pending: Arc<PendingTable>,
        completion: Arc<dyn CompletionHandler>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: WorkQueue::new(capacity),
            directory,
            manager,
            pending,
            completion,
            publisher,
        })
    }

    /// Queue a raw intent for the workers
    pub fn submit(&self, raw: String) -> ModbusResult<()> {
        self.queue
            .push(raw)
            .map_err(|_| ModbusError::internal("write queue is full"))
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Spawn `count` worker tasks that run until shutdown
    pub fn spawn_workers(self: &Arc<Self>, count: usize, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let handler = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while let Some(raw) = handler.queue.pop(&mut shutdown).await {
                        if let Err(e) = handler.handle(&raw) {
                            warn!("Rejected intent: {}", e);
                        }
                    }
                    debug!("Write worker {} stopped", worker);
                })
            })
            .collect()
    }

    /// Execute one raw intent. Errors mean it was malformed or unresolvable;
    /// otherwise the Request Manager status is returned.
    pub fn handle(&self, raw: &str) -> ModbusResult<StackStatus> {
        let intent = WriteIntent::parse(raw)?;
        let key = intent.point_key()?;
        let point = self
            .directory
            .lookup(&key)
            .ok_or_else(|| ModbusError::unknown_point(key.clone()))?;
        let device = point.device_id(self.manager.format())?;

        let op = match (intent.is_write(), intent.value.as_deref()) {
            (true, Some(value)) => Some(WriteOp::encode(&point, value)?),
            _ => None,
        };

        let request = PendingRequest {
            point: Arc::clone(&point),
            kind: if op.is_some() { PendingKind::OnDemandWrite } else { PendingKind::OnDemandRead },
            app_seq: Some(intent.app_seq.clone()),
            version: Some(intent.version.clone()),
            source_topic: Some(intent.sourcetopic.clone()),
            issued_at: chrono::Utc::now(),
        };
        let ref_id = self
            .pending
            .register(request)
            .ok_or_else(|| ModbusError::internal("no free reference id"))?;

        // On-demand requests outrank periodic polling on the same session.
        let target = RequestTarget::new(ref_id, device).with_priority(0);
        let status = match op {
            Some(op) => self.write(target, &point, op),
            None => issue_read(&self.manager, target, &point, Arc::clone(&self.completion)),
        };

        if status.is_success() {
            debug!("On-demand {} of {} issued (ref {})", if intent.is_write() { "write" } else { "read" }, key, ref_id);
        } else {
            warn!("On-demand request for {} not issued: {}", key, status);
            if let Some(request) = self.pending.take(ref_id) {
                self.publisher.publish(PointResult::rejected(&request, status));
            }
        }
        Ok(status)
    }

    fn write(&self, target: RequestTarget, point: &PointConfig, op: WriteOp) -> StackStatus {
        let handler = Some(Arc::clone(&self.completion));
        debug!("{} on {} at address {}", op.function(), point.key(), point.address);
        match op {
            WriteOp::SingleCoil(on) => self.manager.write_single_coil(target, point.address, on, handler),
            WriteOp::SingleRegister(value) => self.manager.write_single_register(target, point.address, value, handler),
            WriteOp::MultipleCoils { quantity, values } => {
                self.manager.write_multiple_coils(target, point.address, quantity, values, handler)
            }
            WriteOp::MultipleRegisters { quantity, values } => {
                self.manager.write_multiple_registers(target, point.address, quantity, values, handler)
            }
        }
    }
}
