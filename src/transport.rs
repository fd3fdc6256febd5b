//! # Frame Transport Layer
//!
//! This module moves complete Modbus frames between a device session and
//! the wire. It knows about frame boundaries but nothing about correlation:
//! the session dispatcher decides what a received frame means.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpFrameTransport`)
//! - One socket per remote endpoint
//! - Frames delimited by the MBAP length field
//!
//! ### Modbus RTU (`RtuFrameTransport`)
//! - Serial port communication (RS-232, RS-485)
//! - Frames delimited by function-specific length, or by the 3.5 character
//!   silent interval when the length cannot be derived
//!
//! ## Cancellation
//!
//! `recv_frame` is called inside a response timeout and may be dropped at any
//! await point. Both implementations read into an internal buffer with
//! `read_buf`, so bytes received before a timeout are kept for the next call.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{GatewayConfig, Parity, SerialSettings};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{rtu_frame_len, tcp_frame_len, FrameFormat, MBAP_HEADER_SIZE};
use crate::logging::{Direction, FrameLogger};
use crate::protocol::{MAX_RTU_ADU, MAX_TCP_ADU};
use crate::request_table::SessionKey;

/// Connect timeout for TCP sessions
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Frame-level transport owned by one device session
///
/// ## Thread Safety
///
/// Implementations are `Send` so a session task can own them; they are never
/// shared between sessions.
#[async_trait]
pub trait FrameTransport: Send {
    /// Wire variant spoken by this transport
    fn format(&self) -> FrameFormat;

    /// Write one complete frame
    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()>;

    /// Wait for the next complete frame. Cancel safe.
    async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>>;

    /// Release the underlying handle
    async fn close(&mut self) -> ModbusResult<()>;

    fn stats(&self) -> TransportStats;
}

/// Opens transports for sessions as they are created
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn format(&self) -> FrameFormat;

    async fn connect(&self, key: SessionKey) -> ModbusResult<Box<dyn FrameTransport>>;
}

/// Modbus TCP transport
pub struct TcpFrameTransport {
    stream: Option<TcpStream>,
    buffer: BytesMut,
    stats: TransportStats,
    logger: Option<FrameLogger>,
}

impl TcpFrameTransport {
    /// Connect to a device endpoint
    pub async fn connect(
        address: std::net::SocketAddr,
        connect_timeout: Duration,
        logger: Option<FrameLogger>,
    ) -> ModbusResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout(format!("connect to {}", address), connect_timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        info!("Connected to Modbus TCP device {}", address);
        Ok(Self::from_stream(stream, logger))
    }

    pub fn from_stream(stream: TcpStream, logger: Option<FrameLogger>) -> Self {
        Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(MAX_TCP_ADU * 2),
            stats: TransportStats::default(),
            logger,
        }
    }

    fn take_frame(&mut self) -> ModbusResult<Option<Vec<u8>>> {
        let len = match tcp_frame_len(&self.buffer) {
            Some(len) => len,
            None => return Ok(None),
        };
        if len < MBAP_HEADER_SIZE + 2 || len > MAX_TCP_ADU {
            self.buffer.clear();
            self.stats.errors += 1;
            return Err(ModbusError::frame(format!("Invalid MBAP length in frame of {} bytes", len)));
        }
        if self.buffer.len() < len {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(len).to_vec()))
    }
}

#[async_trait]
impl FrameTransport for TcpFrameTransport {
    fn format(&self) -> FrameFormat {
        FrameFormat::Tcp
    }

    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP stream closed"))?;

        if let Err(e) = stream.write_all(frame).await {
            self.stats.errors += 1;
            self.stream = None;
            return Err(ModbusError::io(format!("Failed to send TCP frame: {}", e)));
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        if let Some(logger) = &self.logger {
            logger.log_frame(Direction::Outgoing, FrameFormat::Tcp, frame);
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                self.stats.frames_received += 1;
                self.stats.bytes_received += frame.len() as u64;
                if let Some(logger) = &self.logger {
                    logger.log_frame(Direction::Incoming, FrameFormat::Tcp, &frame);
                }
                return Ok(frame);
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ModbusError::connection("TCP stream closed"))?;

            let read = stream.read_buf(&mut self.buffer).await;
            match read {
                Ok(0) => {
                    self.stream = None;
                    return Err(ModbusError::connection("Connection closed by device"));
                }
                Ok(_) => {}
                Err(e) => {
                    self.stats.errors += 1;
                    self.stream = None;
                    return Err(ModbusError::io(format!("TCP read error: {}", e)));
                }
            }
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Modbus RTU transport
pub struct RtuFrameTransport {
    port: Option<tokio_serial::SerialStream>,
    port_name: String,
    /// Silent interval that terminates a frame
    frame_gap: Duration,
    buffer: BytesMut,
    stats: TransportStats,
    logger: Option<FrameLogger>,
}

impl RtuFrameTransport {
    /// Open the serial line
    pub fn open(settings: &SerialSettings, logger: Option<FrameLogger>) -> ModbusResult<Self> {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        let builder = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity);

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!("Failed to open serial port {}: {}", settings.port, e))
        })?;

        info!("Opened serial port {} at {} baud", settings.port, settings.baud_rate);
        Ok(Self {
            port: Some(port),
            port_name: settings.port.clone(),
            frame_gap: settings.frame_gap(),
            buffer: BytesMut::with_capacity(MAX_RTU_ADU * 2),
            stats: TransportStats::default(),
            logger,
        })
    }

    fn take_frame(&mut self) -> ModbusResult<Option<Vec<u8>>> {
        match rtu_frame_len(&self.buffer) {
            Some(len) if len > MAX_RTU_ADU => {
                self.buffer.clear();
                self.stats.errors += 1;
                Err(ModbusError::frame("RTU frame too large"))
            }
            Some(len) if self.buffer.len() >= len => Ok(Some(self.buffer.split_to(len).to_vec())),
            _ => Ok(None),
        }
    }

    fn deliver(&mut self, frame: Vec<u8>) -> Vec<u8> {
        self.stats.frames_received += 1;
        self.stats.bytes_received += frame.len() as u64;
        if let Some(logger) = &self.logger {
            logger.log_frame(Direction::Incoming, FrameFormat::Rtu, &frame);
        }
        frame
    }
}

#[async_trait]
impl FrameTransport for RtuFrameTransport {
    fn format(&self) -> FrameFormat {
        FrameFormat::Rtu
    }

    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        // Bytes left over from an abandoned exchange cannot belong to this one.
        if !self.buffer.is_empty() {
            debug!("Discarding {} stale bytes on {}", self.buffer.len(), self.port_name);
            self.buffer.clear();
        }

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;

        if let Err(e) = port.write_all(frame).await {
            self.stats.errors += 1;
            return Err(ModbusError::io(format!("Failed to send RTU frame: {}", e)));
        }
        let _ = port.flush().await;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        if let Some(logger) = &self.logger {
            logger.log_frame(Direction::Outgoing, FrameFormat::Rtu, frame);
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(self.deliver(frame));
            }

            let port = self
                .port
                .as_mut()
                .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;

            if self.buffer.is_empty() {
                port.read_buf(&mut self.buffer)
                    .await
                    .map_err(|e| ModbusError::io(format!("Serial read error: {}", e)))?;
                continue;
            }

            match timeout(self.frame_gap, port.read_buf(&mut self.buffer)).await {
                Ok(Ok(_)) => {
                    if self.buffer.len() > MAX_RTU_ADU {
                        self.buffer.clear();
                        self.stats.errors += 1;
                        return Err(ModbusError::frame("RTU frame too large"));
                    }
                }
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(ModbusError::io(format!("Serial read error: {}", e)));
                }
                Err(_) => {
                    // Silent interval: whatever is buffered is one frame.
                    let frame = self.buffer.split().to_vec();
                    return Ok(self.deliver(frame));
                }
            }
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.port.take();
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Factory for the real TCP socket and serial line transports
#[derive(Debug, Clone)]
pub struct NetworkTransportFactory {
    format: FrameFormat,
    serial: SerialSettings,
    connect_timeout: Duration,
    logger: Option<FrameLogger>,
}

impl NetworkTransportFactory {
    pub fn tcp(connect_timeout: Duration) -> Self {
        Self {
            format: FrameFormat::Tcp,
            serial: SerialSettings::default(),
            connect_timeout,
            logger: None,
        }
    }

    pub fn rtu(serial: SerialSettings) -> Self {
        Self {
            format: FrameFormat::Rtu,
            serial,
            connect_timeout: Duration::from_secs(1),
            logger: None,
        }
    }

    /// Factory for the configured mode, with packet tracing if enabled
    pub fn from_config(config: &GatewayConfig) -> Self {
        let factory = match config.mode {
            FrameFormat::Tcp => Self::tcp(DEFAULT_CONNECT_TIMEOUT),
            FrameFormat::Rtu => Self::rtu(config.serial.clone()),
        };
        if config.packet_logging {
            factory.with_frame_logger(FrameLogger::new(config.logging_mode))
        } else {
            factory
        }
    }

    /// Trace every frame through `logger`
    pub fn with_frame_logger(mut self, logger: FrameLogger) -> Self {
        self.logger = Some(logger);
        self
    }
}

#[async_trait]
impl TransportFactory for NetworkTransportFactory {
    fn format(&self) -> FrameFormat {
        self.format
    }

    async fn connect(&self, key: SessionKey) -> ModbusResult<Box<dyn FrameTransport>> {
        match (self.format, key) {
            (FrameFormat::Tcp, SessionKey::Tcp(address)) => {
                let transport = TcpFrameTransport::connect(address, self.connect_timeout, self.logger.clone()).await?;
                Ok(Box::new(transport))
            }
            (FrameFormat::Rtu, SessionKey::Serial) => {
                let transport = RtuFrameTransport::open(&self.serial, self.logger.clone())?;
                Ok(Box::new(transport))
            }
            (format, key) => Err(ModbusError::configuration(format!(
                "Session {} cannot be served in {:?} mode",
                key, format
            ))),
        }
    }
}

/// Scripted in-memory transport for unit tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Produces the frames a device answers with for one request frame
    pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

    pub struct MockTransport {
        format: FrameFormat,
        responder: Responder,
        pending: VecDeque<Vec<u8>>,
        sent: Arc<Mutex<Vec<(tokio::time::Instant, Vec<u8>)>>>,
        stats: TransportStats,
    }

    #[async_trait]
    impl FrameTransport for MockTransport {
        fn format(&self) -> FrameFormat {
            self.format
        }

        async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
            self.sent.lock().unwrap().push((tokio::time::Instant::now(), frame.to_vec()));
            self.stats.frames_sent += 1;
            self.pending.extend((self.responder)(frame));
            Ok(())
        }

        async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>> {
            match self.pending.pop_front() {
                Some(frame) => {
                    self.stats.frames_received += 1;
                    Ok(frame)
                }
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            self.stats.clone()
        }
    }

    #[derive(Clone)]
    pub struct MockFactory {
        pub format: FrameFormat,
        pub responder: Responder,
        pub sent: Arc<Mutex<Vec<(tokio::time::Instant, Vec<u8>)>>>,
        pub connects: Arc<AtomicUsize>,
    }

    impl MockFactory {
        pub fn new(format: FrameFormat, responder: Responder) -> Self {
            Self {
                format,
                responder,
                sent: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Device that never answers
        pub fn silent(format: FrameFormat) -> Self {
            Self::new(format, Arc::new(|_: &[u8]| Vec::new()))
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().iter().map(|(_, frame)| frame.clone()).collect()
        }

        pub fn send_times(&self) -> Vec<tokio::time::Instant> {
            self.sent.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        fn format(&self) -> FrameFormat {
            self.format
        }

        async fn connect(&self, _key: SessionKey) -> ModbusResult<Box<dyn FrameTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockTransport {
                format: self.format,
                responder: Arc::clone(&self.responder),
                pending: VecDeque::new(),
                sent: Arc::clone(&self.sent),
                stats: TransportStats::default(),
            }))
        }
    }

    /// Register-read answer for a TCP request: echoes the transaction id and
    /// returns `values` for function 0x03/0x04.
    pub fn tcp_register_reply(request: &[u8], values: &[u16]) -> Vec<u8> {
        let mut pdu = vec![request[7], (values.len() * 2) as u8];
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        tcp_reply(request, &pdu)
    }

    /// Wrap `pdu` in an MBAP header copied from `request`
    pub fn tcp_reply(request: &[u8], pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![request[0], request[1], 0x00, 0x00];
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(request[6]);
        frame.extend_from_slice(pdu);
        frame
    }
}
