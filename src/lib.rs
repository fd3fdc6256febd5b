//! # Voltage Modbus Gateway - Modbus Master Request Engine
//!
//! The Modbus side of an industrial protocol gateway: turns application read
//! and write intents into framed Modbus TCP/RTU requests, tracks every
//! transaction against its device session, correlates responses, and drives a
//! multi-interval polling scheduler for configured points.
//!
//! ## Features
//!
//! - **Request Manager**: one non-blocking call per Modbus function, with
//!   synchronous status codes
//! - **Per-device sessions**: priority-ordered queues, inter-frame delay,
//!   response timeout with bounded retries
//! - **Polling scheduler**: one bucket per interval, driven by a single tick
//! - **On-demand requests**: JSON intents from the bus, queued and executed by
//!   worker tasks
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x14 | Read File Record |
//! | 0x15 | Write File Record |
//! | 0x17 | Read/Write Multiple Registers |
//! | 0x2B | Read Device Identification (MEI 0x0E) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voltage_modbus_gateway::{
//!     CompletionHandler, DeviceId, NetworkTransportFactory, RequestManager, RequestTarget, StackResponse,
//!     StackStatus,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = Arc::new(NetworkTransportFactory::tcp(Duration::from_secs(3)));
//!     let manager = RequestManager::new(factory, 1000);
//!     assert_eq!(manager.start(), StackStatus::Success);
//!
//!     let handler: Arc<dyn CompletionHandler> = Arc::new(|response: StackResponse| {
//!         println!("{:?}: {:02X?}", response.status, response.data);
//!     });
//!     let device = DeviceId::tcp("127.0.0.1:502".parse().unwrap(), 1);
//!     let status = manager.read_holding_registers(RequestTarget::new(1, device), 0, 10, Some(handler));
//!     println!("submitted: {}", status);
//!
//!     tokio::time::sleep(Duration::from_millis(500)).await;
//!     manager.shutdown().await;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  bus intents ──► WriteHandler ──┐          ┌── PollingScheduler ◄── TimeMapper
//!                                 ▼          ▼
//!                          RequestManager (validate, reserve, frame)
//!                                 │
//!                      SessionRegistry ─► Session (queue + dispatcher) ─► transport
//!                                                        │
//!  publisher ◄── ResponseProcessor ◄── CompletionHandler ◄┘
//! ```

/// Core error types, stack status and completion codes
pub mod error;

/// Function codes, bounds table, unit-id rules and byte/word swap
pub mod protocol;

/// Request packet assembly and response frame decoding
pub mod frame;

/// Bounded table of in-flight transactions
pub mod request_table;

/// TCP and RTU frame transports
pub mod transport;

/// Device sessions and their dispatcher tasks
pub mod session;

/// Public request API and stack lifecycle
pub mod manager;

/// Read-only point metadata directory
pub mod directory;

/// Interval buckets and the polling clock
pub mod scheduler;

/// Periodic request issue and the pending request table
pub mod initiator;

/// Response correlation, formatting and scaling
pub mod response;

/// On-demand write/read intents
pub mod write_handler;

/// Wiring of the stack, workers and scheduler into one gateway
pub mod gateway;

/// Work queue and shutdown flag
pub mod queue;

/// YAML configuration and environment overrides
pub mod config;

/// Logging initialisation and frame logger
pub mod logging;

/// Utility functions and performance monitoring
pub mod utils;

// Re-export main types for convenience
pub use config::{GatewayConfig, SerialSettings, StackConfig};
pub use directory::{DataType, PointConfig, PointDirectory, RegisterType, StaticDirectory};
pub use error::{CompletionStatus, ModbusError, ModbusResult, StackStatus};
pub use frame::{FileRecord, FrameFormat};
pub use gateway::Gateway;
pub use logging::{FrameLogger, LoggingMode};
pub use manager::{CompletionHandler, RequestManager, RequestTarget, StackResponse};
pub use protocol::{ModbusFunction, SwapConfig};
pub use request_table::{DeviceId, SessionKey};
pub use response::{PointResult, ResultPublisher, ResultStatus, ScaledValue};
pub use transport::{NetworkTransportFactory, TransportFactory, TransportStats};
pub use utils::PerformanceMetrics;
pub use write_handler::WriteIntent;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Gateway v{} - Modbus master request engine", VERSION)
}
