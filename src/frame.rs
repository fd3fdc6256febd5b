//! Request packet assembly and response frame decoding.
//!
//! A request is described by a [`RequestPdu`] and framed for one of two wire
//! variants:
//!
//! ```text
//! TCP:  | transaction id (2) | protocol id = 0 (2) | length (2) | unit id (1) | PDU |
//! RTU:  | unit id (1) | PDU | CRC16 (2, little-endian) |
//! ```
//!
//! The MBAP length counts the unit id plus the PDU. All numeric PDU fields are
//! big-endian 16-bit.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, UnitId, MAX_RTU_ADU, MAX_TCP_ADU};

/// Modbus TCP Application Protocol header size
pub const MBAP_HEADER_SIZE: usize = 6;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Calculate the RTU CRC of a byte slice
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Wire variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// Length-prefixed MBAP framing over a stream socket
    Tcp,
    /// Unit-addressed framing with CRC over a serial line
    Rtu,
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFormat::Tcp => write!(f, "TCP"),
            FrameFormat::Rtu => write!(f, "RTU"),
        }
    }
}

impl FrameFormat {
    /// Maximum ADU length of the variant
    pub fn max_adu(self) -> usize {
        match self {
            FrameFormat::Tcp => MAX_TCP_ADU,
            FrameFormat::Rtu => MAX_RTU_ADU,
        }
    }

    /// ADU length for a PDU of `pdu_len` bytes
    pub fn adu_len(self, pdu_len: usize) -> usize {
        match self {
            FrameFormat::Tcp => MBAP_HEADER_SIZE + 1 + pdu_len,
            FrameFormat::Rtu => 1 + pdu_len + 2,
        }
    }
}

/// One sub-request of a read/write file record request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub reference_type: u8,
    pub file_number: u16,
    pub record_number: u16,
    pub record_length: u16,
    /// Register values, only present for write file record
    #[serde(default)]
    pub data: Vec<u16>,
}

impl FileRecord {
    /// Bytes this sub-request occupies in the PDU
    pub fn encoded_len(&self) -> usize {
        7 + self.data.len() * 2
    }
}

/// Request PDU without transport framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    /// 0x01..=0x04
    Read {
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    },
    /// 0x05, 0x06
    WriteSingle {
        function: ModbusFunction,
        address: u16,
        value: u16,
    },
    /// 0x0F, 0x10
    WriteMultiple {
        function: ModbusFunction,
        address: u16,
        quantity: u16,
        values: Vec<u8>,
    },
    /// 0x14
    ReadFileRecord {
        byte_count: u8,
        records: Vec<FileRecord>,
    },
    /// 0x15
    WriteFileRecord {
        byte_count: u8,
        records: Vec<FileRecord>,
    },
    /// 0x17
    ReadWriteMultiple {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_quantity: u16,
        values: Vec<u8>,
    },
    /// 0x2B / 0x0E
    ReadDeviceIdentification {
        mei_type: u8,
        read_code: u8,
        object_id: u8,
    },
}

impl RequestPdu {
    pub fn function(&self) -> ModbusFunction {
        match self {
            RequestPdu::Read { function, .. }
            | RequestPdu::WriteSingle { function, .. }
            | RequestPdu::WriteMultiple { function, .. } => *function,
            RequestPdu::ReadFileRecord { .. } => ModbusFunction::ReadFileRecord,
            RequestPdu::WriteFileRecord { .. } => ModbusFunction::WriteFileRecord,
            RequestPdu::ReadWriteMultiple { .. } => ModbusFunction::ReadWriteMultipleRegisters,
            RequestPdu::ReadDeviceIdentification { .. } => ModbusFunction::ReadDeviceIdentification,
        }
    }

    /// Start address carried by the request, 0 when there is none
    pub fn start_address(&self) -> u16 {
        match self {
            RequestPdu::Read { address, .. }
            | RequestPdu::WriteSingle { address, .. }
            | RequestPdu::WriteMultiple { address, .. } => *address,
            RequestPdu::ReadWriteMultiple { read_address, .. } => *read_address,
            _ => 0,
        }
    }

    /// Quantity carried by the request, 0 when there is none
    pub fn quantity(&self) -> u16 {
        match self {
            RequestPdu::Read { quantity, .. } | RequestPdu::WriteMultiple { quantity, .. } => *quantity,
            RequestPdu::WriteSingle { .. } => 1,
            RequestPdu::ReadWriteMultiple { read_quantity, .. } => *read_quantity,
            _ => 0,
        }
    }

    /// Encoded PDU length, computed without allocating
    pub fn encoded_len(&self) -> usize {
        match self {
            RequestPdu::Read { .. } | RequestPdu::WriteSingle { .. } => 5,
            RequestPdu::WriteMultiple { values, .. } => 6 + values.len(),
            RequestPdu::ReadFileRecord { records, .. } | RequestPdu::WriteFileRecord { records, .. } => {
                2 + records.iter().map(FileRecord::encoded_len).sum::<usize>()
            }
            RequestPdu::ReadWriteMultiple { values, .. } => 10 + values.len(),
            RequestPdu::ReadDeviceIdentification { .. } => 4,
        }
    }

    /// Append the PDU to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function().to_u8());
        match self {
            RequestPdu::Read { address, quantity, .. } => {
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            }
            RequestPdu::WriteSingle { address, value, .. } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            RequestPdu::WriteMultiple { address, quantity, values, .. } => {
                buf.put_u16(*address);
                buf.put_u16(*quantity);
                buf.put_u8(values.len() as u8);
                buf.put_slice(values);
            }
            RequestPdu::ReadFileRecord { byte_count, records }
            | RequestPdu::WriteFileRecord { byte_count, records } => {
                buf.put_u8(*byte_count);
                for record in records {
                    buf.put_u8(record.reference_type);
                    buf.put_u16(record.file_number);
                    buf.put_u16(record.record_number);
                    buf.put_u16(record.record_length);
                    for value in &record.data {
                        buf.put_u16(*value);
                    }
                }
            }
            RequestPdu::ReadWriteMultiple {
                read_address,
                read_quantity,
                write_address,
                write_quantity,
                values,
            } => {
                buf.put_u16(*read_address);
                buf.put_u16(*read_quantity);
                buf.put_u16(*write_address);
                buf.put_u16(*write_quantity);
                buf.put_u8(values.len() as u8);
                buf.put_slice(values);
            }
            RequestPdu::ReadDeviceIdentification { mei_type, read_code, object_id } => {
                buf.put_u8(*mei_type);
                buf.put_u8(*read_code);
                buf.put_u8(*object_id);
            }
        }
    }
}

/// Assemble a complete request frame.
///
/// `transaction_id` is only written for TCP. Fails if the frame would exceed
/// the variant's maximum ADU.
pub fn build_request(
    format: FrameFormat,
    transaction_id: u16,
    unit_id: UnitId,
    pdu: &RequestPdu,
) -> ModbusResult<Vec<u8>> {
    let pdu_len = pdu.encoded_len();
    let adu_len = format.adu_len(pdu_len);
    if adu_len > format.max_adu() {
        return Err(ModbusError::frame(format!(
            "frame length {} exceeds maximum ADU {}",
            adu_len,
            format.max_adu()
        )));
    }

    let mut buf = BytesMut::with_capacity(adu_len);
    match format {
        FrameFormat::Tcp => {
            buf.put_u16(transaction_id);
            buf.put_u16(0);
            buf.put_u16((pdu_len + 1) as u16);
            buf.put_u8(unit_id);
            pdu.encode(&mut buf);
        }
        FrameFormat::Rtu => {
            buf.put_u8(unit_id);
            pdu.encode(&mut buf);
            let crc = crc16(&buf);
            buf.put_u16_le(crc);
        }
    }
    Ok(buf.to_vec())
}

/// Header fields re-derived from an assembled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub transaction_id: Option<u16>,
    pub unit_id: UnitId,
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
}

/// Parse the addressing header of a request frame.
///
/// Only meaningful for functions that carry an address and a quantity
/// (0x01..=0x06, 0x0F, 0x10, 0x17).
pub fn parse_request_header(format: FrameFormat, frame: &[u8]) -> ModbusResult<RequestHeader> {
    let (transaction_id, pdu_start) = match format {
        FrameFormat::Tcp => {
            if frame.len() < MBAP_HEADER_SIZE + 6 {
                return Err(ModbusError::frame("Frame too short"));
            }
            let mut cursor = Cursor::new(frame);
            let transaction_id = cursor.read_u16::<BigEndian>()?;
            (Some(transaction_id), MBAP_HEADER_SIZE)
        }
        FrameFormat::Rtu => {
            if frame.len() < 8 {
                return Err(ModbusError::frame("Frame too short"));
            }
            (None, 0)
        }
    };

    let mut cursor = Cursor::new(&frame[pdu_start..]);
    let unit_id = cursor.read_u8()?;
    let function = cursor.read_u8()?;
    let address = cursor.read_u16::<BigEndian>()?;
    let quantity = cursor.read_u16::<BigEndian>()?;

    Ok(RequestHeader {
        transaction_id,
        unit_id,
        function,
        address,
        quantity,
    })
}

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// MBAP transaction id, `None` on the serial line
    pub transaction_id: Option<u16>,
    pub unit_id: UnitId,
    /// Function code with the exception bit cleared
    pub function: u8,
    /// Exception code if the device answered with one
    pub exception: Option<u8>,
    /// PDU bytes after the function code
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Value bytes of a read response (the part after the byte count).
    ///
    /// Write echoes and device identification payloads are returned whole.
    pub fn data_bytes(&self) -> &[u8] {
        match ModbusFunction::from_u8(self.function) {
            Ok(ModbusFunction::ReadCoils)
            | Ok(ModbusFunction::ReadDiscreteInputs)
            | Ok(ModbusFunction::ReadHoldingRegisters)
            | Ok(ModbusFunction::ReadInputRegisters)
            | Ok(ModbusFunction::ReadWriteMultipleRegisters)
            | Ok(ModbusFunction::ReadFileRecord) => {
                if self.payload.is_empty() {
                    return &[];
                }
                let count = self.payload[0] as usize;
                let end = (1 + count).min(self.payload.len());
                &self.payload[1..end]
            }
            _ => &self.payload,
        }
    }
}

fn split_pdu(pdu: &[u8]) -> ModbusResult<(u8, Option<u8>, Vec<u8>)> {
    let (&function_code, rest) = pdu
        .split_first()
        .ok_or_else(|| ModbusError::frame("Empty PDU"))?;

    if function_code & 0x80 != 0 {
        let code = *rest
            .first()
            .ok_or_else(|| ModbusError::frame("Invalid exception response"))?;
        return Ok((function_code & 0x7F, Some(code), Vec::new()));
    }

    Ok((function_code, None, rest.to_vec()))
}

/// Decode a complete MBAP frame
pub fn decode_tcp_response(frame: &[u8]) -> ModbusResult<ResponseFrame> {
    if frame.len() < MBAP_HEADER_SIZE + 2 {
        return Err(ModbusError::frame("Frame too short"));
    }

    let mut cursor = Cursor::new(frame);
    let transaction_id = cursor.read_u16::<BigEndian>()?;
    let protocol_id = cursor.read_u16::<BigEndian>()?;
    let length = cursor.read_u16::<BigEndian>()? as usize;

    if protocol_id != 0 {
        return Err(ModbusError::frame(format!("Unexpected protocol id {}", protocol_id)));
    }
    if length < 2 || frame.len() < MBAP_HEADER_SIZE + length {
        return Err(ModbusError::frame("Incomplete frame"));
    }

    let unit_id = frame[MBAP_HEADER_SIZE];
    let (function, exception, payload) = split_pdu(&frame[MBAP_HEADER_SIZE + 1..MBAP_HEADER_SIZE + length])?;

    Ok(ResponseFrame {
        transaction_id: Some(transaction_id),
        unit_id,
        function,
        exception,
        payload,
    })
}

/// Decode a complete RTU frame, verifying its CRC
pub fn decode_rtu_response(frame: &[u8]) -> ModbusResult<ResponseFrame> {
    if frame.len() < 5 {
        return Err(ModbusError::frame("Frame too short"));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let calculated = crc16(body);
    if received != calculated {
        return Err(ModbusError::crc_mismatch(calculated, received));
    }

    let (function, exception, payload) = split_pdu(&body[1..])?;

    Ok(ResponseFrame {
        transaction_id: None,
        unit_id: body[0],
        function,
        exception,
        payload,
    })
}

/// Length of an MBAP frame once its header is available
pub fn tcp_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < MBAP_HEADER_SIZE {
        return None;
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    Some(MBAP_HEADER_SIZE + length)
}

/// Length of an RTU response frame, if enough of it is buffered to tell.
///
/// Serial frames carry no length field, so the size is derived from the
/// function code and, for variable-length responses, the byte count.
pub fn rtu_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let function = buf[1];
    if function & 0x80 != 0 {
        return Some(5);
    }
    match function {
        0x01 | 0x02 | 0x03 | 0x04 | 0x14 | 0x15 | 0x17 => buf.get(2).map(|&count| 3 + count as usize + 2),
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        // Device identification responses are decoded from the gap-terminated buffer.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_holding(address: u16, quantity: u16) -> RequestPdu {
        RequestPdu::Read {
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
        }
    }

    #[test]
    fn test_crc_calculation() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_tcp_request_layout() {
        let frame = build_request(FrameFormat::Tcp, 0x0102, 0x11, &read_holding(0x006B, 3)).unwrap();
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_rtu_request_layout() {
        let frame = build_request(FrameFormat::Rtu, 0, 0x01, &read_holding(0, 2)).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_header_rederivation_both_variants() {
        for format in [FrameFormat::Tcp, FrameFormat::Rtu] {
            for (address, quantity) in [(0u16, 1u16), (100, 125), (0xFFFF, 7)] {
                let frame = build_request(format, 42, 9, &read_holding(address, quantity)).unwrap();
                let header = parse_request_header(format, &frame).unwrap();
                assert_eq!(header.address, address);
                assert_eq!(header.quantity, quantity);
                assert_eq!(header.unit_id, 9);
                assert_eq!(header.function, 0x03);
                match format {
                    FrameFormat::Tcp => assert_eq!(header.transaction_id, Some(42)),
                    FrameFormat::Rtu => assert_eq!(header.transaction_id, None),
                }
            }
        }
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let pdu = RequestPdu::WriteMultiple {
            function: ModbusFunction::WriteMultipleRegisters,
            address: 1,
            quantity: 2,
            values: vec![0x00, 0x0A, 0x01, 0x02],
        };
        let frame = build_request(FrameFormat::Tcp, 1, 1, &pdu).unwrap();
        assert_eq!(frame.len(), FrameFormat::Tcp.adu_len(pdu.encoded_len()));
        assert_eq!(&frame[4..6], &[0x00, 0x0B]);
        assert_eq!(&frame[7..], &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let records = (0..40)
            .map(|i| FileRecord {
                reference_type: 6,
                file_number: 1,
                record_number: i,
                record_length: 2,
                data: vec![0x1111, 0x2222],
            })
            .collect();
        let pdu = RequestPdu::WriteFileRecord { byte_count: 0xF5, records };
        assert!(pdu.encoded_len() > MAX_TCP_ADU);
        assert!(build_request(FrameFormat::Tcp, 1, 1, &pdu).is_err());
    }

    #[test]
    fn test_decode_tcp_response() {
        let frame = [0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x12, 0x00, 0x34];
        let response = decode_tcp_response(&frame).unwrap();
        assert_eq!(response.transaction_id, Some(7));
        assert_eq!(response.function, 0x03);
        assert_eq!(response.data_bytes(), &[0x00, 0x12, 0x00, 0x34]);
        assert_eq!(tcp_frame_len(&frame), Some(frame.len()));
    }

    #[test]
    fn test_decode_exception_response() {
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let response = decode_tcp_response(&frame).unwrap();
        assert_eq!(response.function, 0x03);
        assert_eq!(response.exception, Some(0x02));
    }

    #[test]
    fn test_decode_rtu_response() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(rtu_frame_len(&frame), Some(frame.len()));

        let response = decode_rtu_response(&frame).unwrap();
        assert_eq!(response.unit_id, 1);
        assert_eq!(response.data_bytes(), &[0x00, 0x2A]);

        frame[3] ^= 0xFF;
        assert!(matches!(decode_rtu_response(&frame), Err(ModbusError::CrcMismatch { .. })));
    }
}
