//! Read-only point directory.
//!
//! A point is one named value on one device. The directory maps a point key
//! (`<wellhead>/<device>/<metric>`) to its immutable metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::FrameFormat;
use crate::protocol::{validate_unit_id, ModbusFunction, SwapConfig, UnitId};
use crate::request_table::DeviceId;
use crate::DEFAULT_TCP_PORT;

/// Modbus data table a point lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterType {
    pub fn read_function(self) -> ModbusFunction {
        match self {
            RegisterType::Coil => ModbusFunction::ReadCoils,
            RegisterType::DiscreteInput => ModbusFunction::ReadDiscreteInputs,
            RegisterType::Holding => ModbusFunction::ReadHoldingRegisters,
            RegisterType::Input => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Write function for a point of `width`; `None` for read-only tables
    pub fn write_function(self, width: u16) -> Option<ModbusFunction> {
        match (self, width) {
            (RegisterType::Coil, 1) => Some(ModbusFunction::WriteSingleCoil),
            (RegisterType::Coil, _) => Some(ModbusFunction::WriteMultipleCoils),
            (RegisterType::Holding, 1) => Some(ModbusFunction::WriteSingleRegister),
            (RegisterType::Holding, _) => Some(ModbusFunction::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }
}

/// Declared value type of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    #[default]
    Int,
    Uint,
    Float,
    Double,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int => "int",
            DataType::Uint => "uint",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_priority() -> i64 {
    1
}

fn default_width() -> u16 {
    1
}

/// Metadata of one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub wellhead: String,
    pub device: String,
    pub metric: String,
    /// `ip:port` of the device in TCP mode
    #[serde(default)]
    pub endpoint: Option<String>,
    pub unit_id: UnitId,
    pub register_type: RegisterType,
    pub address: u16,
    /// Width in registers (or bits for coil/discrete input points)
    #[serde(default = "default_width")]
    pub width: u16,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub byte_swap: bool,
    #[serde(default)]
    pub word_swap: bool,
    /// Polling interval; points without one are only read on demand
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

impl PointConfig {
    /// Directory key `<wellhead>/<device>/<metric>`
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.wellhead, self.device, self.metric)
    }

    pub fn swap(&self) -> SwapConfig {
        SwapConfig::new(self.byte_swap, self.word_swap)
    }

    /// Resolve the target device for the transport mode
    pub fn device_id(&self, mode: FrameFormat) -> ModbusResult<DeviceId> {
        match mode {
            FrameFormat::Rtu => Ok(DeviceId::serial(self.unit_id)),
            FrameFormat::Tcp => {
                let endpoint = self.endpoint.as_deref().ok_or_else(|| {
                    ModbusError::configuration(format!("Point {} has no endpoint", self.key()))
                })?;
                // A bare IP address means the standard Modbus TCP port.
                let addr = endpoint
                    .parse::<SocketAddr>()
                    .or_else(|_| endpoint.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DEFAULT_TCP_PORT)))
                    .map_err(|e| {
                        ModbusError::configuration(format!("Point {}: bad endpoint '{}': {}", self.key(), endpoint, e))
                    })?;
                Ok(DeviceId::tcp(addr, self.unit_id))
            }
        }
    }

    pub fn validate(&self, mode: FrameFormat) -> ModbusResult<()> {
        validate_unit_id(self.unit_id)
            .map_err(|_| {
                ModbusError::configuration(format!("Point {}: invalid unit id {}", self.key(), self.unit_id))
            })?;
        if self.width == 0 {
            return Err(ModbusError::configuration(format!("Point {}: width must be non-zero", self.key())));
        }
        if self.polling_interval_ms == Some(0) {
            return Err(ModbusError::configuration(format!("Point {}: polling interval must be non-zero", self.key())));
        }
        self.device_id(mode).map(|_| ())
    }
}

/// Read-only lookup of point metadata by key
pub trait PointDirectory: Send + Sync {
    fn lookup(&self, key: &str) -> Option<Arc<PointConfig>>;

    /// Every point, in key order
    fn points(&self) -> Vec<Arc<PointConfig>>;
}

/// Directory backed by the configuration file
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    points: BTreeMap<String, Arc<PointConfig>>,
}

impl StaticDirectory {
    /// Build from configured points; later duplicates of a key are rejected
    pub fn new(points: Vec<PointConfig>) -> ModbusResult<Self> {
        let mut map = BTreeMap::new();
        for point in points {
            let key = point.key();
            if map.insert(key.clone(), Arc::new(point)).is_some() {
                return Err(ModbusError::configuration(format!("Duplicate point {}", key)));
            }
        }
        Ok(Self { points: map })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl PointDirectory for StaticDirectory {
    fn lookup(&self, key: &str) -> Option<Arc<PointConfig>> {
        self.points.get(key).cloned()
    }

    fn points(&self) -> Vec<Arc<PointConfig>> {
        self.points.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(metric: &str) -> PointConfig {
        PointConfig {
            wellhead: "PL0".to_string(),
            device: "flowmeter".to_string(),
            metric: metric.to_string(),
            endpoint: Some("127.0.0.1:1502".to_string()),
            unit_id: 1,
            register_type: RegisterType::Holding,
            address: 10,
            width: 2,
            data_type: DataType::Int,
            scale: 1.0,
            byte_swap: false,
            word_swap: false,
            polling_interval_ms: Some(1000),
            priority: 1,
        }
    }

    #[test]
    fn test_lookup_by_key() {
        let directory = StaticDirectory::new(vec![point("Flow"), point("Pressure")]).unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.lookup("PL0/flowmeter/Flow").unwrap().address, 10);
        assert!(directory.lookup("PL0/flowmeter/Missing").is_none());
        assert!(StaticDirectory::new(vec![point("Flow"), point("Flow")]).is_err());
    }

    #[test]
    fn test_function_selection() {
        assert_eq!(RegisterType::Coil.write_function(1), Some(ModbusFunction::WriteSingleCoil));
        assert_eq!(RegisterType::Coil.write_function(8), Some(ModbusFunction::WriteMultipleCoils));
        assert_eq!(RegisterType::Holding.write_function(1), Some(ModbusFunction::WriteSingleRegister));
        assert_eq!(RegisterType::Holding.write_function(2), Some(ModbusFunction::WriteMultipleRegisters));
        assert_eq!(RegisterType::Input.write_function(1), None);
        assert_eq!(RegisterType::DiscreteInput.write_function(1), None);
        assert_eq!(RegisterType::Input.read_function(), ModbusFunction::ReadInputRegisters);
    }

    #[test]
    fn test_endpoint_without_port_uses_default() {
        let mut bare = point("Flow");
        bare.endpoint = Some("10.0.0.7".to_string());
        let device = bare.device_id(FrameFormat::Tcp).unwrap();
        assert_eq!(device, DeviceId::tcp("10.0.0.7:502".parse().unwrap(), 1));

        bare.endpoint = Some("plc.local".to_string());
        assert!(bare.device_id(FrameFormat::Tcp).is_err());
    }

    #[test]
    fn test_point_from_yaml() {
        let yaml = "wellhead: PL1\ndevice: pump\nmetric: Speed\nunit_id: 5\nregister_type: input\naddress: 3\n";
        let point: PointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(point.width, 1);
        assert_eq!(point.scale, 1.0);
        assert_eq!(point.priority, 1);
        assert_eq!(point.device_id(FrameFormat::Rtu).unwrap(), DeviceId::serial(5));
        assert!(point.validate(FrameFormat::Tcp).is_err());
    }
}
