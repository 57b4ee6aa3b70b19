//! Register catalog and value codec
//!
//! Every register the engine knows about is described by a static
//! [`RegisterDescriptor`]: wire type, scale factor, access and optional
//! engineering-unit bounds. The codec converts between raw wire words and
//! engineering values, validating writes before any I/O happens.

mod catalog;

pub use catalog::{all, by_address, by_key, REGISTER_COUNT};

use thiserror::Error;

/// Wire representation of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    /// One unsigned 16-bit word
    UInt16,
    /// One signed 16-bit word (two's complement)
    Int16,
    /// Two words combined into an unsigned 32-bit value, low word first
    UInt32,
    /// Two words carrying an IEEE-754 single, low word first
    Float,
}

impl WireType {
    /// Number of 16-bit registers the type occupies
    pub fn word_count(&self) -> usize {
        match self {
            WireType::UInt16 | WireType::Int16 => 1,
            WireType::UInt32 | WireType::Float => 2,
        }
    }
}

/// Register access class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Telemetry; the device rejects writes
    ReadOnly,
    /// Configuration; readable and writable
    ReadWrite,
}

/// Functional grouping used for listing and display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// Live telemetry
    LiveData,
    /// Lifetime statistics
    Statistics,
    /// Battery characteristics
    Battery,
    /// Charger behavior
    Charger,
    /// Protection thresholds
    Safety,
    /// Advanced tuning
    Advanced,
    /// Device/system options
    System,
}

impl RegisterGroup {
    /// Group name for display
    pub fn name(&self) -> &'static str {
        match self {
            RegisterGroup::LiveData => "live",
            RegisterGroup::Statistics => "statistics",
            RegisterGroup::Battery => "battery",
            RegisterGroup::Charger => "charger",
            RegisterGroup::Safety => "safety",
            RegisterGroup::Advanced => "advanced",
            RegisterGroup::System => "system",
        }
    }
}

/// Static description of one register
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    /// Register address
    pub address: u16,
    /// Stable lookup key
    pub key: &'static str,
    /// Human-readable label
    pub label: &'static str,
    /// Engineering unit suffix
    pub unit: &'static str,
    /// Functional group
    pub group: RegisterGroup,
    /// Wire representation
    pub wire_type: WireType,
    /// Multiplier applied to the raw value
    pub scale: f64,
    /// Access class
    pub access: Access,
    /// Inclusive engineering-unit bounds for writes
    pub bounds: Option<(f64, f64)>,
}

impl RegisterDescriptor {
    /// Number of wire words this register occupies
    pub fn word_count(&self) -> usize {
        self.wire_type.word_count()
    }

    /// Decode raw wire words into an engineering value
    pub fn decode(&self, raw: &[u16]) -> Result<f64, RegisterError> {
        if raw.len() < self.word_count() {
            return Err(RegisterError::WordCount {
                key: self.key,
                expected: self.word_count(),
                actual: raw.len(),
            });
        }

        let value = match self.wire_type {
            WireType::UInt16 => raw[0] as f64,
            WireType::Int16 => {
                let word = raw[0] as i32;
                let signed = if word > 0x7FFF { word - 0x10000 } else { word };
                signed as f64
            }
            WireType::UInt32 => {
                let combined = (raw[0] as u32) | ((raw[1] as u32) << 16);
                combined as f64
            }
            WireType::Float => {
                let bits = (raw[0] as u32) | ((raw[1] as u32) << 16);
                f32::from_bits(bits) as f64
            }
        };

        Ok(value * self.scale)
    }

    /// Encode an engineering value into raw wire words
    ///
    /// Fails before any I/O when the register is read-only, the value does
    /// not fit the wire type, or it falls outside the descriptor bounds.
    pub fn encode(&self, value: f64) -> Result<Vec<u16>, RegisterError> {
        if self.access == Access::ReadOnly {
            return Err(RegisterError::ReadOnly { key: self.key });
        }

        if let Some((min, max)) = self.bounds {
            if value < min || value > max {
                return Err(RegisterError::OutOfBounds {
                    key: self.key,
                    value,
                    min,
                    max,
                });
            }
        }

        match self.wire_type {
            WireType::UInt16 => {
                let raw = (value / self.scale).round();
                if !(0.0..=u16::MAX as f64).contains(&raw) {
                    return Err(RegisterError::NotRepresentable {
                        key: self.key,
                        value,
                    });
                }
                Ok(vec![raw as u16])
            }
            WireType::Int16 => {
                let raw = (value / self.scale).round();
                if !(i16::MIN as f64..=i16::MAX as f64).contains(&raw) {
                    return Err(RegisterError::NotRepresentable {
                        key: self.key,
                        value,
                    });
                }
                Ok(vec![(raw as i16) as u16])
            }
            WireType::UInt32 => {
                let raw = (value / self.scale).round();
                if !(0.0..=u32::MAX as f64).contains(&raw) {
                    return Err(RegisterError::NotRepresentable {
                        key: self.key,
                        value,
                    });
                }
                let combined = raw as u32;
                Ok(vec![
                    (combined & 0xFFFF) as u16,
                    (combined >> 16) as u16,
                ])
            }
            WireType::Float => {
                let scaled = value / self.scale;
                if !scaled.is_finite() {
                    return Err(RegisterError::NotRepresentable {
                        key: self.key,
                        value,
                    });
                }
                let bits = (scaled as f32).to_bits();
                Ok(vec![(bits & 0xFFFF) as u16, (bits >> 16) as u16])
            }
        }
    }
}

/// A decoded register value
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReading {
    /// Register address
    pub address: u16,
    /// Catalog key
    pub key: &'static str,
    /// Engineering unit
    pub unit: &'static str,
    /// Raw wire words as received
    pub raw: Vec<u16>,
    /// Engineering value after scale application
    pub value: f64,
}

/// Register catalog and codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegisterError {
    /// Address is not in the catalog
    #[error("unknown register address {0:#06x}")]
    UnknownAddress(u16),

    /// Key is not in the catalog
    #[error("unknown register key '{0}'")]
    UnknownKey(String),

    /// Write attempted on a telemetry register
    #[error("register '{key}' is read-only")]
    ReadOnly {
        /// Catalog key
        key: &'static str,
    },

    /// Value violates the descriptor bounds
    #[error("value {value} for '{key}' outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// Catalog key
        key: &'static str,
        /// Offending engineering value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// Scaled value does not fit the wire type
    #[error("value {value} for '{key}' not representable on the wire")]
    NotRepresentable {
        /// Catalog key
        key: &'static str,
        /// Offending engineering value
        value: f64,
    },

    /// Wrong number of raw words supplied to the decoder
    #[error("'{key}' needs {expected} word(s), got {actual}")]
    WordCount {
        /// Catalog key
        key: &'static str,
        /// Words the wire type occupies
        expected: usize,
        /// Words supplied
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(wire_type: WireType, scale: f64) -> RegisterDescriptor {
        RegisterDescriptor {
            address: 0x0100,
            key: "test_register",
            label: "Test Register",
            unit: "",
            group: RegisterGroup::Advanced,
            wire_type,
            scale,
            access: Access::ReadWrite,
            bounds: None,
        }
    }

    #[test]
    fn test_int16_reinterpretation() {
        let desc = descriptor(WireType::Int16, 0.1);
        assert_eq!(desc.decode(&[0x8000]).unwrap(), -3276.8);
        assert_eq!(desc.decode(&[0xFFFF]).unwrap(), -0.1);
        assert_eq!(desc.decode(&[0x0001]).unwrap(), 0.1);
    }

    #[test]
    fn test_uint16_scaling() {
        let desc = descriptor(WireType::UInt16, 0.001);
        assert_eq!(desc.decode(&[4200]).unwrap(), 4.2);
    }

    #[test]
    fn test_uint32_word_order() {
        let desc = descriptor(WireType::UInt32, 1.0);
        // 0x0001_0000 arrives as low word 0x0000, high word 0x0001
        assert_eq!(desc.decode(&[0x0000, 0x0001]).unwrap(), 65536.0);
        assert_eq!(desc.encode(65536.0).unwrap(), vec![0x0000, 0x0001]);
    }

    #[test]
    fn test_float_roundtrip() {
        let desc = descriptor(WireType::Float, 1.0);
        let words = desc.encode(26.4).unwrap();
        let back = desc.decode(&words).unwrap();
        assert!((back - 26.4).abs() < 1e-5);
    }

    #[test]
    fn test_encode_decode_roundtrip_scaled() {
        let desc = descriptor(WireType::UInt16, 0.01);
        let words = desc.encode(314.0).unwrap();
        assert_eq!(words, vec![31400]);
        assert_eq!(desc.decode(&words).unwrap(), 314.0);
    }

    #[test]
    fn test_read_only_rejected_before_io() {
        let mut desc = descriptor(WireType::UInt16, 1.0);
        desc.access = Access::ReadOnly;
        assert!(matches!(
            desc.encode(1.0),
            Err(RegisterError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_bounds_enforced() {
        let mut desc = descriptor(WireType::UInt16, 1.0);
        desc.bounds = Some((1200.0, 4500.0));
        assert!(desc.encode(3650.0).is_ok());
        assert!(matches!(
            desc.encode(100.0),
            Err(RegisterError::OutOfBounds { .. })
        ));
        assert!(matches!(
            desc.encode(5000.0),
            Err(RegisterError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_wire_range_enforced() {
        let desc = descriptor(WireType::UInt16, 1.0);
        assert!(matches!(
            desc.encode(70000.0),
            Err(RegisterError::NotRepresentable { .. })
        ));
        assert!(matches!(
            desc.encode(-1.0),
            Err(RegisterError::NotRepresentable { .. })
        ));

        let signed = descriptor(WireType::Int16, 1.0);
        assert_eq!(signed.encode(-40.0).unwrap(), vec![0xFFD8]);
        assert!(signed.encode(40000.0).is_err());
    }

    #[test]
    fn test_short_word_slice_rejected() {
        let desc = descriptor(WireType::UInt32, 1.0);
        assert!(matches!(
            desc.decode(&[1]),
            Err(RegisterError::WordCount { .. })
        ));
    }
}
