/// Request Manager: the public entry point of the master stack.
///
/// Every Modbus operation is one call that validates its inputs, reserves a
/// slot in the Request Table, assembles the frame and hands it to the session
/// of the target device. Calls never block on I/O and never return
/// `ModbusError`; the outcome is a [`StackStatus`] returned synchronously, and
/// the eventual response arrives through the request's [`CompletionHandler`].
///
/// The stack has a simple lifecycle: configure while disabled, [`start`],
/// issue requests, [`shutdown`].
///
/// [`start`]: RequestManager::start
/// [`shutdown`]: RequestManager::shutdown

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::error::{CompletionStatus, StackStatus};
use crate::frame::{build_request, FileRecord, FrameFormat, RequestPdu};
use crate::protocol::{
    validate_quantity, validate_unit_id, ModbusFunction, COIL_OFF, COIL_ON, FILE_RECORD_REFERENCE_TYPE,
    MEI_READ_DEVICE_ID,
};
use crate::queue::ShutdownTrigger;
use crate::request_table::{DeviceId, RequestEntry, RequestTable, SessionKey};
use crate::session::{SessionRegistry, SessionState};
use crate::transport::TransportFactory;
use crate::utils::PerformanceMetrics;

/// Outcome of one transaction, handed to its completion handler
#[derive(Debug, Clone, PartialEq)]
pub struct StackResponse {
    pub transaction_id: u16,
    pub app_transaction_id: u16,
    pub function: ModbusFunction,
    pub device: DeviceId,
    pub status: CompletionStatus,
    /// Response data: register or bit bytes for reads, echoed fields for writes
    pub data: Vec<u8>,
    pub start_address: u16,
    pub quantity: u16,
    pub received_at: DateTime<Utc>,
    pub responded_at: DateTime<Utc>,
}

impl StackResponse {
    /// Exception code, 0 when the device did not answer with an exception
    pub fn exception_code(&self) -> u8 {
        self.status.exception_code()
    }
}

/// Receives the outcome of a request exactly once
pub trait CompletionHandler: Send + Sync {
    fn complete(&self, response: StackResponse);
}

impl<F> CompletionHandler for F
where
    F: Fn(StackResponse) + Send + Sync,
{
    fn complete(&self, response: StackResponse) {
        self(response)
    }
}

/// Caller context shared by every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTarget {
    pub app_transaction_id: u16,
    pub device: DeviceId,
    /// Lower value is more urgent
    pub priority: i64,
}

impl RequestTarget {
    pub fn new(app_transaction_id: u16, device: DeviceId) -> Self {
        Self {
            app_transaction_id,
            device,
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

struct Running {
    registry: Arc<SessionRegistry>,
    trigger: ShutdownTrigger,
}

/// Modbus master request engine
pub struct RequestManager {
    format: FrameFormat,
    table: Arc<RequestTable>,
    factory: Arc<dyn TransportFactory>,
    config: Mutex<StackConfig>,
    running: Mutex<Option<Running>>,
}

impl RequestManager {
    /// Create a disabled stack with `max_requests_in_flight` table slots
    pub fn new(factory: Arc<dyn TransportFactory>, max_requests_in_flight: usize) -> Self {
        Self {
            format: factory.format(),
            table: RequestTable::new(max_requests_in_flight, u16::MAX),
            factory,
            config: Mutex::new(StackConfig::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config_guard(&self) -> MutexGuard<'_, StackConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn table(&self) -> &Arc<RequestTable> {
        &self.table
    }

    pub fn stack_config(&self) -> StackConfig {
        *self.config_guard()
    }

    /// Replace the timing configuration. Rejected while the stack is enabled.
    pub fn set_stack_config(&self, config: StackConfig) -> StackStatus {
        let running = self.running();
        if running.is_some() {
            warn!("Stack configuration change rejected while the stack is enabled");
            return StackStatus::StackAlreadyInitialized;
        }
        *self.config_guard() = config;
        StackStatus::Success
    }

    pub fn is_enabled(&self) -> bool {
        self.running().is_some()
    }

    /// Enable the stack. Sessions are created on the first request to each
    /// device, on the runtime this is called from.
    pub fn start(&self) -> StackStatus {
        let mut running = self.running();
        if running.is_some() {
            return StackStatus::StackAlreadyInitialized;
        }
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot start stack outside a tokio runtime: {}", e);
                return StackStatus::StackNotInitialized;
            }
        };

        let config = *self.config_guard();
        let trigger = ShutdownTrigger::new();
        let registry = SessionRegistry::new(Arc::clone(&self.factory), config, runtime, trigger.subscribe());
        *running = Some(Running {
            registry: Arc::new(registry),
            trigger,
        });
        info!(
            "Modbus {} stack started (response timeout {:?}, inter-frame delay {:?}, retries {})",
            self.format,
            config.response_timeout(),
            config.inter_frame_delay(),
            config.max_retries
        );
        StackStatus::Success
    }

    /// Disable the stack: every session drains, failing queued and in-flight
    /// requests with [`CompletionStatus::Shutdown`]. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        running.trigger.trigger();
        running.registry.join().await;
        info!("Modbus stack stopped, {} request(s) still tracked", self.table.len());
    }

    /// Dispatcher state of the session serving `session`, if it exists
    pub fn session_state(&self, session: SessionKey) -> Option<SessionState> {
        let registry = self.registry()?;
        registry.session(session).map(|s| s.state())
    }

    /// Round-trip statistics of one session
    pub fn session_metrics(&self, session: SessionKey) -> Option<PerformanceMetrics> {
        let registry = self.registry()?;
        registry.session(session).map(|s| s.metrics())
    }

    fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.running().as_ref().map(|running| Arc::clone(&running.registry))
    }

    /// Read coils (function code 0x01)
    pub fn read_coils(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.read(ModbusFunction::ReadCoils, target, address, quantity, handler)
    }

    /// Read discrete inputs (function code 0x02)
    pub fn read_discrete_inputs(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.read(ModbusFunction::ReadDiscreteInputs, target, address, quantity, handler)
    }

    /// Read holding registers (function code 0x03)
    pub fn read_holding_registers(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.read(ModbusFunction::ReadHoldingRegisters, target, address, quantity, handler)
    }

    /// Read input registers (function code 0x04)
    pub fn read_input_registers(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.read(ModbusFunction::ReadInputRegisters, target, address, quantity, handler)
    }

    fn read(
        &self,
        function: ModbusFunction,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        if validate_quantity(function, quantity, 0).is_err() {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::Read { function, address, quantity };
        self.submit(target, pdu, 0, handler)
    }

    /// Write single coil (function code 0x05)
    pub fn write_single_coil(
        &self,
        target: RequestTarget,
        address: u16,
        on: bool,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        let pdu = RequestPdu::WriteSingle {
            function: ModbusFunction::WriteSingleCoil,
            address,
            value: if on { COIL_ON } else { COIL_OFF },
        };
        self.submit(target, pdu, 0, handler)
    }

    /// Write single register (function code 0x06)
    pub fn write_single_register(
        &self,
        target: RequestTarget,
        address: u16,
        value: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        let pdu = RequestPdu::WriteSingle {
            function: ModbusFunction::WriteSingleRegister,
            address,
            value,
        };
        self.submit(target, pdu, 0, handler)
    }

    /// Write multiple coils (function code 0x0F). `values` holds the packed
    /// coil bits, least significant bit first.
    pub fn write_multiple_coils(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        values: Vec<u8>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.write_multiple(ModbusFunction::WriteMultipleCoils, target, address, quantity, values, handler)
    }

    /// Write multiple registers (function code 0x10). `values` holds the
    /// big-endian register bytes.
    pub fn write_multiple_registers(
        &self,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        values: Vec<u8>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        self.write_multiple(ModbusFunction::WriteMultipleRegisters, target, address, quantity, values, handler)
    }

    fn write_multiple(
        &self,
        function: ModbusFunction,
        target: RequestTarget,
        address: u16,
        quantity: u16,
        values: Vec<u8>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        let byte_count = values.len();
        if byte_count > u8::MAX as usize || validate_quantity(function, quantity, byte_count as u16).is_err() {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::WriteMultiple {
            function,
            address,
            quantity,
            values,
        };
        self.submit(target, pdu, byte_count as u16, handler)
    }

    /// Read file record (function code 0x14)
    pub fn read_file_record(
        &self,
        target: RequestTarget,
        byte_count: u8,
        records: Vec<FileRecord>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        if !valid_file_records(ModbusFunction::ReadFileRecord, byte_count, &records) {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::ReadFileRecord { byte_count, records };
        self.submit(target, pdu, byte_count as u16, handler)
    }

    /// Write file record (function code 0x15)
    pub fn write_file_record(
        &self,
        target: RequestTarget,
        byte_count: u8,
        records: Vec<FileRecord>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        if !valid_file_records(ModbusFunction::WriteFileRecord, byte_count, &records) {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::WriteFileRecord { byte_count, records };
        self.submit(target, pdu, byte_count as u16, handler)
    }

    /// Read/write multiple registers (function code 0x17)
    #[allow(clippy::too_many_arguments)]
    pub fn read_write_multiple_registers(
        &self,
        target: RequestTarget,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_quantity: u16,
        values: Vec<u8>,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        let byte_count = values.len();
        if byte_count > u8::MAX as usize
            || validate_quantity(ModbusFunction::ReadHoldingRegisters, read_quantity, 0).is_err()
            || validate_quantity(ModbusFunction::ReadWriteMultipleRegisters, write_quantity, byte_count as u16)
                .is_err()
        {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::ReadWriteMultiple {
            read_address,
            read_quantity,
            write_address,
            write_quantity,
            values,
        };
        self.submit(target, pdu, byte_count as u16, handler)
    }

    /// Read device identification (function code 0x2B, MEI type 0x0E)
    pub fn read_device_identification(
        &self,
        target: RequestTarget,
        mei_type: u8,
        read_code: u8,
        object_id: u8,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        if mei_type != MEI_READ_DEVICE_ID || !(1..=4).contains(&read_code) {
            return StackStatus::InvalidInputParameter;
        }
        let pdu = RequestPdu::ReadDeviceIdentification {
            mei_type,
            read_code,
            object_id,
        };
        self.submit(target, pdu, 0, handler)
    }

    fn target_matches_mode(&self, device: &DeviceId) -> bool {
        matches!(
            (self.format, device.session),
            (FrameFormat::Tcp, SessionKey::Tcp(_)) | (FrameFormat::Rtu, SessionKey::Serial)
        )
    }

    fn submit(
        &self,
        target: RequestTarget,
        pdu: RequestPdu,
        byte_count: u16,
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> StackStatus {
        let function = pdu.function();
        let Some(handler) = handler else {
            return StackStatus::InvalidInputParameter;
        };
        if validate_unit_id(target.device.unit_id).is_err() || !self.target_matches_mode(&target.device) {
            return StackStatus::InvalidInputParameter;
        }

        let Some(registry) = self.registry() else {
            return StackStatus::StackNotInitialized;
        };

        let Some(slot) = self.table.reserve(target.app_transaction_id, function, target.device) else {
            warn!("Request table full, rejecting {} for {}", function, target.device);
            return StackStatus::MaxRequestsInFlight;
        };

        // Dropping the slot on any early return releases the reservation.
        let frame = match build_request(self.format, slot.transaction_id(), target.device.unit_id, &pdu) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{} for {} rejected: {}", function, target.device, e);
                return StackStatus::PacketLengthExceeded;
            }
        };

        let transaction_id = slot.transaction_id();
        let entry = RequestEntry::new(
            slot,
            target.app_transaction_id,
            function,
            target.device,
            pdu.start_address(),
            pdu.quantity(),
            byte_count,
            target.priority,
            frame,
            handler,
        );

        match registry.enqueue(entry) {
            Ok(()) => {
                debug!(
                    "Queued {} for {} (transaction {}, app id {})",
                    function, target.device, transaction_id, target.app_transaction_id
                );
                StackStatus::Success
            }
            Err(entry) => {
                warn!("Session for {} refused transaction {}", entry.device, transaction_id);
                drop(entry);
                StackStatus::QueueSendFailed
            }
        }
    }
}

fn valid_file_records(function: ModbusFunction, byte_count: u8, records: &[FileRecord]) -> bool {
    if records.is_empty() || validate_quantity(function, byte_count as u16, 0).is_err() {
        return false;
    }
    // The byte count goes on the wire as given, so it must describe the records.
    if records.iter().map(FileRecord::encoded_len).sum::<usize>() != byte_count as usize {
        return false;
    }
    records.iter().all(|record| {
        record.reference_type == FILE_RECORD_REFERENCE_TYPE
            && match function {
                ModbusFunction::WriteFileRecord => record.data.len() == record.record_length as usize,
                _ => record.data.is_empty(),
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{tcp_register_reply, tcp_reply, MockFactory};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn device() -> DeviceId {
        DeviceId::tcp("127.0.0.1:1502".parse::<SocketAddr>().unwrap(), 1)
    }

    fn target(app_id: u16) -> RequestTarget {
        RequestTarget::new(app_id, device())
    }

    fn collector() -> (Option<Arc<dyn CompletionHandler>>, mpsc::UnboundedReceiver<StackResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn CompletionHandler> = Arc::new(move |response: StackResponse| {
            let _ = tx.send(response);
        });
        (Some(handler), rx)
    }

    fn echo_factory() -> MockFactory {
        MockFactory::new(
            FrameFormat::Tcp,
            Arc::new(|request: &[u8]| match request[7] {
                0x03 | 0x04 => vec![tcp_register_reply(request, &[0x1234, 0x5678])],
                _ => vec![tcp_reply(request, &request[7..12])],
            }),
        )
    }

    fn started(factory: MockFactory, slots: usize) -> RequestManager {
        let manager = RequestManager::new(Arc::new(factory), slots);
        assert_eq!(manager.start(), StackStatus::Success);
        manager
    }

    #[tokio::test]
    async fn test_read_round_trip() {
        let manager = started(echo_factory(), 10);
        let (handler, mut rx) = collector();

        assert_eq!(manager.read_holding_registers(target(11), 100, 2, handler), StackStatus::Success);
        let response = rx.recv().await.unwrap();

        assert_eq!(response.status, CompletionStatus::Success);
        assert_eq!(response.app_transaction_id, 11);
        assert_eq!(response.start_address, 100);
        assert_eq!(response.quantity, 2);
        assert_eq!(response.data, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(response.exception_code(), 0);
        assert!(manager.table().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_input_validation() {
        let manager = started(MockFactory::silent(FrameFormat::Tcp), 10);
        let (handler, _rx) = collector();

        assert_eq!(manager.read_coils(target(1), 0, 0, handler.clone()), StackStatus::InvalidInputParameter);
        assert_eq!(manager.read_coils(target(1), 0, 2001, handler.clone()), StackStatus::InvalidInputParameter);
        assert_eq!(
            manager.read_holding_registers(target(1), 0, 126, handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(manager.read_coils(target(1), 0, 8, None), StackStatus::InvalidInputParameter);

        let reserved = RequestTarget::new(1, DeviceId::tcp(device_addr(), 250));
        assert_eq!(manager.read_coils(reserved, 0, 8, handler.clone()), StackStatus::InvalidInputParameter);
        let broadcast = RequestTarget::new(1, DeviceId::tcp(device_addr(), 0));
        assert_eq!(manager.read_coils(broadcast, 0, 8, handler.clone()), StackStatus::InvalidInputParameter);
        let serial = RequestTarget::new(1, DeviceId::serial(1));
        assert_eq!(manager.read_coils(serial, 0, 8, handler.clone()), StackStatus::InvalidInputParameter);

        assert_eq!(
            manager.write_multiple_registers(target(1), 0, 2, vec![0; 3], handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(
            manager.write_multiple_coils(target(1), 0, 10, vec![0xFF], handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(
            manager.read_device_identification(target(1), 0x0D, 1, 0, handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(
            manager.read_device_identification(target(1), MEI_READ_DEVICE_ID, 5, 0, handler),
            StackStatus::InvalidInputParameter
        );
        assert!(manager.table().is_empty());
        manager.shutdown().await;
    }

    fn device_addr() -> SocketAddr {
        "127.0.0.1:1502".parse().unwrap()
    }

    #[tokio::test]
    async fn test_table_full() {
        let manager = RequestManager::new(Arc::new(MockFactory::silent(FrameFormat::Tcp)), 2);
        manager.set_stack_config(StackConfig::from_millis(30_000, 0));
        assert_eq!(manager.start(), StackStatus::Success);
        let (handler, mut rx) = collector();

        assert_eq!(manager.read_coils(target(1), 0, 1, handler.clone()), StackStatus::Success);
        assert_eq!(manager.read_coils(target(2), 0, 1, handler.clone()), StackStatus::Success);
        assert_eq!(manager.read_coils(target(3), 0, 1, handler), StackStatus::MaxRequestsInFlight);
        assert_eq!(manager.table().len(), 2);

        manager.shutdown().await;
        let mut shut = 0;
        while let Ok(response) = rx.try_recv() {
            assert_eq!(response.status, CompletionStatus::Shutdown);
            shut += 1;
        }
        assert_eq!(shut, 2);
        assert!(manager.table().is_empty());
    }

    #[tokio::test]
    async fn test_file_record_byte_count_must_match_records() {
        let manager = started(MockFactory::silent(FrameFormat::Tcp), 4);
        let (handler, _rx) = collector();

        // Two sub-requests of 7 + 2*6 bytes each.
        let records: Vec<FileRecord> = (0..2)
            .map(|i| FileRecord {
                reference_type: FILE_RECORD_REFERENCE_TYPE,
                file_number: 1,
                record_number: i,
                record_length: 6,
                data: vec![0xABCD; 6],
            })
            .collect();
        assert_eq!(
            manager.write_file_record(target(1), 0xF5, records.clone(), handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(
            manager.write_file_record(target(1), 37, records.clone(), handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert!(manager.table().is_empty());
        assert_eq!(
            manager.write_file_record(target(1), 38, records, handler.clone()),
            StackStatus::Success
        );
        assert_eq!(manager.table().len(), 1);

        let reads = vec![FileRecord {
            reference_type: FILE_RECORD_REFERENCE_TYPE,
            file_number: 1,
            record_number: 0,
            record_length: 2,
            data: Vec::new(),
        }];
        assert_eq!(
            manager.read_file_record(target(2), 6, reads.clone(), handler.clone()),
            StackStatus::InvalidInputParameter
        );
        assert_eq!(manager.read_file_record(target(2), 7, reads, handler.clone()), StackStatus::Success);

        let bad_reference = vec![FileRecord {
            reference_type: 5,
            file_number: 1,
            record_number: 0,
            record_length: 2,
            data: Vec::new(),
        }];
        assert_eq!(
            manager.read_file_record(target(1), 7, bad_reference, handler),
            StackStatus::InvalidInputParameter
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let manager = RequestManager::new(Arc::new(MockFactory::silent(FrameFormat::Tcp)), 4);
        let (handler, _rx) = collector();

        assert_eq!(manager.read_coils(target(1), 0, 1, handler.clone()), StackStatus::StackNotInitialized);
        assert_eq!(manager.set_stack_config(StackConfig::from_millis(500, 10)), StackStatus::Success);
        assert_eq!(manager.start(), StackStatus::Success);
        assert_eq!(manager.start(), StackStatus::StackAlreadyInitialized);
        assert_eq!(
            manager.set_stack_config(StackConfig::from_millis(100, 0)),
            StackStatus::StackAlreadyInitialized
        );
        assert_eq!(manager.stack_config().response_timeout_us, 500_000);

        manager.shutdown().await;
        manager.shutdown().await;
        assert!(!manager.is_enabled());
        assert_eq!(manager.read_coils(target(1), 0, 1, handler), StackStatus::StackNotInitialized);
        assert_eq!(manager.set_stack_config(StackConfig::default()), StackStatus::Success);
    }

    #[tokio::test]
    async fn test_write_frames() {
        let factory = echo_factory();
        let manager = started(factory.clone(), 10);
        let (handler, mut rx) = collector();

        assert_eq!(manager.write_single_coil(target(1), 7, true, handler.clone()), StackStatus::Success);
        assert_eq!(rx.recv().await.unwrap().status, CompletionStatus::Success);
        assert_eq!(
            manager.write_multiple_registers(target(2), 3, 2, vec![0x00, 0x0A, 0x01, 0x02], handler),
            StackStatus::Success
        );
        let response = rx.recv().await.unwrap();
        assert_eq!(response.function, ModbusFunction::WriteMultipleRegisters);

        let sent = factory.sent_frames();
        assert_eq!(&sent[0][7..], &[0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert_eq!(&sent[1][7..], &[0x10, 0x00, 0x03, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_ne!(&sent[0][..2], &sent[1][..2]);
        manager.shutdown().await;
    }
}
