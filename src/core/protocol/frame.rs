//! Frame encoding/decoding per command family
//!
//! Requests are built into the generic envelope; responses are parsed back
//! out of it. Write-style commands (write individual/block, MODBUS write,
//! restart) are answered with an ACK/NACK frame that reuses the command
//! slot as a status byte: `0x01` for ACK, `0x00` for NACK. Payload offset 0
//! echoes the original command; a NACK carries the device error code at
//! payload offset 1.
//!
//! Field endianness: the proprietary families (0x07/0x09/0x0B/0x0D) carry
//! addresses and register data little-endian. The MODBUS families
//! (0x03/0x10) carry address, quantity and register data big-endian, as in
//! standard MODBUS.

use thiserror::Error;

use super::crc::crc16;
use super::{FRAME_OVERHEAD, MAX_PAYLOAD_LEN, PREAMBLE};

/// Command slot value of a positive acknowledge response
pub const STATUS_ACK: u8 = 0x01;

/// Command slot value of a negative acknowledge response
pub const STATUS_NACK: u8 = 0x00;

/// Register count limit for block reads/writes (device limit)
pub const MAX_BLOCK_REGISTERS: usize = 125;

/// Register count limit for MODBUS multi-register writes
pub const MAX_MODBUS_WRITE_REGISTERS: usize = 123;

/// TinyBMS command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Restart / clear (0x02)
    Restart = 0x02,
    /// MODBUS-compatible register read (0x03)
    ModbusRead = 0x03,
    /// Proprietary block read (0x07)
    ReadBlock = 0x07,
    /// Read individual register (0x09)
    ReadIndividual = 0x09,
    /// Proprietary block write (0x0B)
    WriteBlock = 0x0B,
    /// Write individual register (0x0D)
    WriteIndividual = 0x0D,
    /// MODBUS-compatible register write (0x10)
    ModbusWrite = 0x10,
    /// Read newest events (0x11)
    ReadNewestEvents = 0x11,
    /// Read all events (0x12)
    ReadAllEvents = 0x12,
    /// Read pack voltage (0x14)
    ReadPackVoltage = 0x14,
    /// Read pack current (0x15)
    ReadPackCurrent = 0x15,
    /// Read maximum cell voltage (0x16)
    ReadMaxCellVoltage = 0x16,
    /// Read minimum cell voltage (0x17)
    ReadMinCellVoltage = 0x17,
    /// Read online status (0x18)
    ReadOnlineStatus = 0x18,
    /// Read lifetime counter (0x19)
    ReadLifetimeCounter = 0x19,
    /// Read estimated state of charge (0x1A)
    ReadStateOfCharge = 0x1A,
    /// Read temperatures (0x1B)
    ReadTemperatures = 0x1B,
    /// Read cell voltages (0x1C)
    ReadCellVoltages = 0x1C,
    /// Read settings info (0x1D)
    ReadSettingsInfo = 0x1D,
    /// Read firmware version (0x1E)
    ReadVersion = 0x1E,
    /// Read extended firmware version (0x1F)
    ReadVersionExtended = 0x1F,
    /// Read calculated values (0x20)
    ReadCalculatedValues = 0x20,
}

impl Command {
    /// Decode an opcode byte
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(Command::Restart),
            0x03 => Some(Command::ModbusRead),
            0x07 => Some(Command::ReadBlock),
            0x09 => Some(Command::ReadIndividual),
            0x0B => Some(Command::WriteBlock),
            0x0D => Some(Command::WriteIndividual),
            0x10 => Some(Command::ModbusWrite),
            0x11 => Some(Command::ReadNewestEvents),
            0x12 => Some(Command::ReadAllEvents),
            0x14 => Some(Command::ReadPackVoltage),
            0x15 => Some(Command::ReadPackCurrent),
            0x16 => Some(Command::ReadMaxCellVoltage),
            0x17 => Some(Command::ReadMinCellVoltage),
            0x18 => Some(Command::ReadOnlineStatus),
            0x19 => Some(Command::ReadLifetimeCounter),
            0x1A => Some(Command::ReadStateOfCharge),
            0x1B => Some(Command::ReadTemperatures),
            0x1C => Some(Command::ReadCellVoltages),
            0x1D => Some(Command::ReadSettingsInfo),
            0x1E => Some(Command::ReadVersion),
            0x1F => Some(Command::ReadVersionExtended),
            0x20 => Some(Command::ReadCalculatedValues),
            _ => None,
        }
    }

    /// Human-readable command name
    pub fn name(&self) -> &'static str {
        match self {
            Command::Restart => "Restart",
            Command::ModbusRead => "MODBUS Read",
            Command::ReadBlock => "Read Block",
            Command::ReadIndividual => "Read Individual",
            Command::WriteBlock => "Write Block",
            Command::WriteIndividual => "Write Individual",
            Command::ModbusWrite => "MODBUS Write",
            Command::ReadNewestEvents => "Read Newest Events",
            Command::ReadAllEvents => "Read All Events",
            Command::ReadPackVoltage => "Read Pack Voltage",
            Command::ReadPackCurrent => "Read Pack Current",
            Command::ReadMaxCellVoltage => "Read Max Cell Voltage",
            Command::ReadMinCellVoltage => "Read Min Cell Voltage",
            Command::ReadOnlineStatus => "Read Online Status",
            Command::ReadLifetimeCounter => "Read Lifetime Counter",
            Command::ReadStateOfCharge => "Read State Of Charge",
            Command::ReadTemperatures => "Read Temperatures",
            Command::ReadCellVoltages => "Read Cell Voltages",
            Command::ReadSettingsInfo => "Read Settings Info",
            Command::ReadVersion => "Read Version",
            Command::ReadVersionExtended => "Read Version Extended",
            Command::ReadCalculatedValues => "Read Calculated Values",
        }
    }

    /// True for the no-payload telemetry family (0x11..=0x20)
    pub fn is_simple(&self) -> bool {
        (*self as u8) >= 0x11
    }
}

/// Restart command option byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RestartOption {
    /// Clear the event log
    ClearEvents = 0x01,
    /// Clear the statistics counters
    ClearStats = 0x02,
    /// Reboot the BMS
    Reboot = 0x05,
}

/// Frame-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// First byte of the candidate range is not the preamble
    #[error("missing preamble: got {0:#04x}")]
    BadPreamble(u8),

    /// Candidate range is shorter than the advertised frame
    #[error("truncated frame: need {expected} bytes, have {available}")]
    Truncated {
        /// Total bytes the frame requires
        expected: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Trailing checksum does not match the recomputed one
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC recomputed over the frame body
        expected: u16,
        /// CRC found on the wire
        actual: u16,
    },

    /// Payload does not fit the length byte
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Register count outside the command family's limit
    #[error("register count {0} out of range")]
    RegisterCountOutOfRange(usize),

    /// Response frame carries a different command than expected
    #[error("unexpected response command {actual:#04x} (expected {expected:#04x})")]
    UnexpectedCommand {
        /// Command the caller was waiting for
        expected: u8,
        /// Command found in the frame
        actual: u8,
    },

    /// Response payload does not match the family layout
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
}

/// One logical protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command opcode, or the ACK/NACK status byte on write responses
    pub command: u8,
    /// Payload bytes between the length byte and the CRC
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame; payload must fit the one-byte length field
    pub fn new(command: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { command, payload })
    }

    /// Total size of the encoded frame
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode to wire bytes, CRC appended low byte first
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(PREAMBLE);
        bytes.push(self.command);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);

        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Decode a candidate byte range
    ///
    /// The caller must supply at least the full `3 + N + 2` bytes the length
    /// field advertises. A CRC mismatch is reported as a value, never a
    /// panic; the reassembler uses it to resynchronize.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() || data[0] != PREAMBLE {
            return Err(FrameError::BadPreamble(data.first().copied().unwrap_or(0)));
        }

        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::Truncated {
                expected: FRAME_OVERHEAD,
                available: data.len(),
            });
        }

        let payload_len = data[2] as usize;
        let total_len = FRAME_OVERHEAD + payload_len;
        if data.len() < total_len {
            return Err(FrameError::Truncated {
                expected: total_len,
                available: data.len(),
            });
        }

        let actual = u16::from_le_bytes([data[total_len - 2], data[total_len - 1]]);
        let expected = crc16(&data[..total_len - 2]);
        if actual != expected {
            return Err(FrameError::CrcMismatch { expected, actual });
        }

        Ok(Self {
            command: data[1],
            payload: data[3..3 + payload_len].to_vec(),
        })
    }

    /// True when the command slot carries a write status byte
    pub fn is_status(&self) -> bool {
        self.command == STATUS_ACK || self.command == STATUS_NACK
    }

    // ---- Request builders ----

    /// Read-individual request (0x09)
    pub fn read_individual(address: u16) -> Self {
        Self {
            command: Command::ReadIndividual as u8,
            payload: address.to_le_bytes().to_vec(),
        }
    }

    /// Write-individual request (0x0D)
    pub fn write_individual(address: u16, value: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        Self {
            command: Command::WriteIndividual as u8,
            payload,
        }
    }

    /// Restart request (0x02)
    pub fn restart(option: RestartOption) -> Self {
        Self {
            command: Command::Restart as u8,
            payload: vec![option as u8],
        }
    }

    /// Block-read request (0x07)
    pub fn read_block(start: u16, count: u8) -> Result<Self, FrameError> {
        if count == 0 || count as usize > MAX_BLOCK_REGISTERS {
            return Err(FrameError::RegisterCountOutOfRange(count as usize));
        }
        let mut payload = Vec::with_capacity(3);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.push(count);
        Ok(Self {
            command: Command::ReadBlock as u8,
            payload,
        })
    }

    /// Block-write request (0x0B)
    pub fn write_block(start: u16, values: &[u16]) -> Result<Self, FrameError> {
        if values.is_empty() || values.len() > MAX_BLOCK_REGISTERS {
            return Err(FrameError::RegisterCountOutOfRange(values.len()));
        }
        let mut payload = Vec::with_capacity(3 + values.len() * 2);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.push(values.len() as u8);
        for value in values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(Command::WriteBlock as u8, payload)
    }

    /// MODBUS read request (0x03); fields big-endian
    pub fn modbus_read(start: u16, quantity: u16) -> Result<Self, FrameError> {
        if quantity == 0 || quantity as usize > MAX_BLOCK_REGISTERS {
            return Err(FrameError::RegisterCountOutOfRange(quantity as usize));
        }
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&quantity.to_be_bytes());
        Ok(Self {
            command: Command::ModbusRead as u8,
            payload,
        })
    }

    /// MODBUS write request (0x10); fields and register data big-endian
    pub fn modbus_write(start: u16, values: &[u16]) -> Result<Self, FrameError> {
        if values.is_empty() || values.len() > MAX_MODBUS_WRITE_REGISTERS {
            return Err(FrameError::RegisterCountOutOfRange(values.len()));
        }
        let byte_count = values.len() * 2;
        let mut payload = Vec::with_capacity(5 + byte_count);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
        payload.push(byte_count as u8);
        for value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Self::new(Command::ModbusWrite as u8, payload)
    }

    /// No-payload request for the 0x11..=0x20 telemetry family
    pub fn simple(command: Command) -> Self {
        Self {
            command: command as u8,
            payload: Vec::new(),
        }
    }
}

/// Outcome of a write-style exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckNack {
    /// Positive acknowledge; carries the echoed command
    Ack {
        /// Command that was acknowledged
        command: u8,
    },
    /// Negative acknowledge with a device error code
    Nack {
        /// Command that was rejected
        command: u8,
        /// Device-specific error code
        error_code: u8,
    },
}

/// Parse a read-individual response: address echo + register value
pub fn parse_read_individual(frame: &Frame) -> Result<(u16, u16), FrameError> {
    expect_command(frame, Command::ReadIndividual)?;
    if frame.payload.len() < 4 {
        return Err(FrameError::MalformedPayload(
            "read-individual response needs address and data words",
        ));
    }
    let address = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
    let value = u16::from_le_bytes([frame.payload[2], frame.payload[3]]);
    Ok((address, value))
}

/// Parse a block-read response: start-address echo + little-endian words
pub fn parse_read_block(frame: &Frame) -> Result<(u16, Vec<u16>), FrameError> {
    expect_command(frame, Command::ReadBlock)?;
    if frame.payload.len() < 2 || (frame.payload.len() - 2) % 2 != 0 {
        return Err(FrameError::MalformedPayload(
            "block-read response needs start address and whole data words",
        ));
    }
    let start = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
    let values = frame.payload[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok((start, values))
}

/// Parse a MODBUS read response: byte count + big-endian registers
pub fn parse_modbus_read(frame: &Frame) -> Result<Vec<u16>, FrameError> {
    expect_command(frame, Command::ModbusRead)?;
    let byte_count = *frame
        .payload
        .first()
        .ok_or(FrameError::MalformedPayload("missing byte count"))? as usize;
    if byte_count % 2 != 0 || frame.payload.len() < 1 + byte_count {
        return Err(FrameError::MalformedPayload(
            "MODBUS byte count disagrees with payload",
        ));
    }
    Ok(frame.payload[1..1 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parse an ACK/NACK response to a write-style command
pub fn parse_ack(frame: &Frame) -> Result<AckNack, FrameError> {
    let command = frame.payload.first().copied().unwrap_or(0);
    match frame.command {
        STATUS_ACK => Ok(AckNack::Ack { command }),
        STATUS_NACK => {
            let error_code = frame.payload.get(1).copied().unwrap_or(0xFF);
            Ok(AckNack::Nack {
                command,
                error_code,
            })
        }
        other => Err(FrameError::UnexpectedCommand {
            expected: STATUS_ACK,
            actual: other,
        }),
    }
}

/// Interpret a simple-family response payload as little-endian words
pub fn parse_simple_words(frame: &Frame) -> Result<Vec<u16>, FrameError> {
    if frame.payload.len() % 2 != 0 {
        return Err(FrameError::MalformedPayload(
            "simple response payload is not whole words",
        ));
    }
    Ok(frame
        .payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Interpret a simple-family response payload as one little-endian f32
pub fn parse_simple_f32(frame: &Frame) -> Result<f32, FrameError> {
    if frame.payload.len() < 4 {
        return Err(FrameError::MalformedPayload(
            "float response needs four bytes",
        ));
    }
    Ok(f32::from_le_bytes([
        frame.payload[0],
        frame.payload[1],
        frame.payload[2],
        frame.payload[3],
    ]))
}

fn expect_command(frame: &Frame, expected: Command) -> Result<(), FrameError> {
    if frame.command != expected as u8 {
        return Err(FrameError::UnexpectedCommand {
            expected: expected as u8,
            actual: frame.command,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_individual_roundtrip() {
        let request = Frame::read_individual(0x012C);
        let encoded = request.to_bytes();
        assert_eq!(encoded.len(), 7);
        assert_eq!(&encoded[..5], &[0xAA, 0x09, 0x02, 0x2C, 0x01]);

        let decoded = Frame::parse(&encoded).expect("frame should decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_write_individual_roundtrip() {
        let request = Frame::write_individual(0x013B, 0x0ED8);
        let decoded = Frame::parse(&request.to_bytes()).expect("frame should decode");
        assert_eq!(decoded.command, Command::WriteIndividual as u8);
        let address = u16::from_le_bytes([decoded.payload[0], decoded.payload[1]]);
        let value = u16::from_le_bytes([decoded.payload[2], decoded.payload[3]]);
        assert_eq!((address, value), (0x013B, 0x0ED8));
    }

    #[test]
    fn test_restart_frame_layout() {
        let encoded = Frame::restart(RestartOption::Reboot).to_bytes();
        assert_eq!(&encoded[..4], &[0xAA, 0x02, 0x01, 0x05]);
    }

    #[test]
    fn test_corrupted_crc_is_reported_not_panicked() {
        let mut encoded = Frame::read_individual(0x0157).to_bytes();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            Frame::parse(&encoded),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let encoded = Frame::write_individual(0x012C, 42).to_bytes();
        let err = Frame::parse(&encoded[..encoded.len() - 3]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                expected: encoded.len(),
                available: encoded.len() - 3,
            }
        );
    }

    #[test]
    fn test_modbus_fields_are_big_endian() {
        let frame = Frame::modbus_read(0x012C, 3).expect("valid quantity");
        assert_eq!(frame.payload, vec![0x01, 0x2C, 0x00, 0x03]);

        let frame = Frame::modbus_write(0x0100, &[0x1234]).expect("valid count");
        // start BE, quantity BE, byte count, data BE
        assert_eq!(frame.payload, vec![0x01, 0x00, 0x00, 0x01, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_modbus_read_response_parse() {
        let response = Frame {
            command: Command::ModbusRead as u8,
            payload: vec![0x04, 0x00, 0x64, 0x01, 0x2C],
        };
        assert_eq!(parse_modbus_read(&response).unwrap(), vec![100, 300]);
    }

    #[test]
    fn test_block_limits() {
        assert!(Frame::read_block(0, 0).is_err());
        assert!(Frame::read_block(0, 125).is_ok());
        let too_many = vec![0u16; MAX_BLOCK_REGISTERS + 1];
        assert!(Frame::write_block(0, &too_many).is_err());
    }

    #[test]
    fn test_ack_nack_convention() {
        let ack = Frame {
            command: STATUS_ACK,
            payload: vec![Command::WriteIndividual as u8],
        };
        assert_eq!(
            parse_ack(&ack).unwrap(),
            AckNack::Ack {
                command: Command::WriteIndividual as u8
            }
        );

        let nack = Frame {
            command: STATUS_NACK,
            payload: vec![Command::WriteIndividual as u8, 0x03],
        };
        assert_eq!(
            parse_ack(&nack).unwrap(),
            AckNack::Nack {
                command: Command::WriteIndividual as u8,
                error_code: 0x03
            }
        );
    }

    #[test]
    fn test_known_read_response_bytes() {
        // Response carrying raw 0x07D0 for register 0x0157
        let mut bytes = vec![0xAA, 0x09, 0x04, 0x57, 0x01, 0xD0, 0x07];
        let crc = crate::core::protocol::crc::crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let frame = Frame::parse(&bytes).expect("frame should decode");
        let (address, value) = parse_read_individual(&frame).expect("valid response");
        assert_eq!(address, 0x0157);
        assert_eq!(value, 0x07D0);
    }
}
