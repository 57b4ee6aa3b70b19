//! In-process TinyBMS emulator
//!
//! A transport whose far end is a simulated BMS: request frames written
//! with `send` are parsed and answered over the event channel with
//! correctly framed responses. Fault injection makes timeout, CRC and NACK
//! paths reproducible in tests; optional jitter makes demo telemetry move.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BmsTransport, TransportError, TransportEvent, TransportStats};
use crate::core::protocol::frame::{
    Command, Frame, RestartOption, MAX_BLOCK_REGISTERS, STATUS_ACK, STATUS_NACK,
};
use crate::core::protocol::StreamReassembler;
use crate::core::registers;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Device error code: unsupported command
pub const ERR_UNSUPPORTED_COMMAND: u8 = 0x01;

/// Device error code: write to a read-only or unknown register
pub const ERR_ILLEGAL_REGISTER: u8 = 0x02;

/// A scheduled response fault
#[derive(Debug, Clone)]
pub enum Fault {
    /// Swallow the next response entirely (provokes a timeout)
    DropResponse,
    /// Flip a CRC bit in the next response (provokes a resync)
    CorruptCrc,
    /// Answer the next request with a NACK carrying this error code
    Nack(u8),
    /// Prepend garbage bytes to the next response
    GarbagePrefix(Vec<u8>),
}

struct EmulatorShared {
    events: broadcast::Sender<TransportEvent>,
    bank: Mutex<HashMap<u16, u16>>,
    reassembler: Mutex<StreamReassembler>,
    faults: Mutex<VecDeque<Fault>>,
    stats: RwLock<TransportStats>,
    open: AtomicBool,
    jitter: bool,
}

impl EmulatorShared {
    fn respond(&self, request: &Frame) -> Option<Frame> {
        let command = request.command;
        match Command::from_u8(command) {
            Some(Command::ReadIndividual) => {
                if request.payload.len() < 2 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let address = u16::from_le_bytes([request.payload[0], request.payload[1]]);
                let value = self.read_word(address);
                let mut payload = Vec::with_capacity(4);
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(&value.to_le_bytes());
                Some(Frame { command, payload })
            }
            Some(Command::ReadBlock) => {
                if request.payload.len() < 3 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let start = u16::from_le_bytes([request.payload[0], request.payload[1]]);
                let count = (request.payload[2] as u16).min(MAX_BLOCK_REGISTERS as u16);
                let mut payload = Vec::with_capacity(2 + count as usize * 2);
                payload.extend_from_slice(&start.to_le_bytes());
                for offset in 0..count {
                    payload.extend_from_slice(
                        &self.read_word(start.wrapping_add(offset)).to_le_bytes(),
                    );
                }
                Some(Frame { command, payload })
            }
            Some(Command::ModbusRead) => {
                if request.payload.len() < 4 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let start = u16::from_be_bytes([request.payload[0], request.payload[1]]);
                let quantity = u16::from_be_bytes([request.payload[2], request.payload[3]])
                    .min(MAX_BLOCK_REGISTERS as u16);
                let mut payload = Vec::with_capacity(1 + quantity as usize * 2);
                payload.push((quantity * 2) as u8);
                for offset in 0..quantity {
                    payload.extend_from_slice(
                        &self.read_word(start.wrapping_add(offset)).to_be_bytes(),
                    );
                }
                Some(Frame { command, payload })
            }
            Some(Command::WriteIndividual) => {
                if request.payload.len() < 4 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let address = u16::from_le_bytes([request.payload[0], request.payload[1]]);
                let value = u16::from_le_bytes([request.payload[2], request.payload[3]]);
                if !self.writable(address) {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                self.bank.lock().insert(address, value);
                Some(ack(command))
            }
            Some(Command::WriteBlock) => {
                if request.payload.len() < 3 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let start = u16::from_le_bytes([request.payload[0], request.payload[1]]);
                let count = request.payload[2] as usize;
                if request.payload.len() < 3 + count * 2 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let mut bank = self.bank.lock();
                for i in 0..count {
                    let word = u16::from_le_bytes([
                        request.payload[3 + i * 2],
                        request.payload[4 + i * 2],
                    ]);
                    bank.insert(start.wrapping_add(i as u16), word);
                }
                Some(ack(command))
            }
            Some(Command::ModbusWrite) => {
                if request.payload.len() < 5 {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let start = u16::from_be_bytes([request.payload[0], request.payload[1]]);
                let quantity =
                    u16::from_be_bytes([request.payload[2], request.payload[3]]) as usize;
                let byte_count = request.payload[4] as usize;
                if byte_count != quantity * 2 || request.payload.len() < 5 + byte_count {
                    return Some(nack(command, ERR_ILLEGAL_REGISTER));
                }
                let mut bank = self.bank.lock();
                for i in 0..quantity {
                    let word = u16::from_be_bytes([
                        request.payload[5 + i * 2],
                        request.payload[6 + i * 2],
                    ]);
                    bank.insert(start.wrapping_add(i as u16), word);
                }
                Some(ack(command))
            }
            Some(Command::Restart) => {
                if request.payload.first() == Some(&(RestartOption::ClearStats as u8)) {
                    let mut bank = self.bank.lock();
                    bank.insert(32, 0);
                    bank.insert(33, 0);
                    bank.insert(100, 0);
                    bank.insert(101, 0);
                }
                Some(ack(command))
            }
            Some(simple) if simple.is_simple() => Some(Frame {
                command,
                payload: self.simple_payload(simple),
            }),
            _ => Some(nack(command, ERR_UNSUPPORTED_COMMAND)),
        }
    }

    fn simple_payload(&self, command: Command) -> Vec<u8> {
        match command {
            Command::ReadPackVoltage => self.float_payload(36),
            Command::ReadPackCurrent => self.float_payload(38),
            Command::ReadOnlineStatus => self.read_word(50).to_le_bytes().to_vec(),
            Command::ReadStateOfCharge => {
                let raw =
                    (self.read_word(46) as u32) | ((self.read_word(47) as u32) << 16);
                raw.to_le_bytes().to_vec()
            }
            Command::ReadTemperatures => {
                let mut payload = Vec::with_capacity(6);
                for address in [48u16, 42, 43] {
                    payload.extend_from_slice(&self.read_word(address).to_le_bytes());
                }
                payload
            }
            Command::ReadCellVoltages => {
                let mut payload = Vec::with_capacity(32);
                for address in 0u16..16 {
                    payload.extend_from_slice(&self.read_word(address).to_le_bytes());
                }
                payload
            }
            Command::ReadMinCellVoltage => self.read_word(40).to_le_bytes().to_vec(),
            Command::ReadMaxCellVoltage => self.read_word(41).to_le_bytes().to_vec(),
            Command::ReadLifetimeCounter => {
                let raw =
                    (self.read_word(32) as u32) | ((self.read_word(33) as u32) << 16);
                raw.to_le_bytes().to_vec()
            }
            // Event logs, settings and version blobs are empty in the emulator
            _ => Vec::new(),
        }
    }

    fn float_payload(&self, address: u16) -> Vec<u8> {
        let bits =
            (self.read_word(address) as u32) | ((self.read_word(address + 1) as u32) << 16);
        let mut value = f32::from_bits(bits);
        if self.jitter {
            value += rand::thread_rng().gen_range(-0.05f32..0.05f32);
        }
        value.to_le_bytes().to_vec()
    }

    fn read_word(&self, address: u16) -> u16 {
        self.bank.lock().get(&address).copied().unwrap_or(0)
    }

    fn writable(&self, address: u16) -> bool {
        match registers::by_address(address) {
            Some(desc) => desc.access == crate::core::registers::Access::ReadWrite,
            // Uncatalogued addresses accept writes; the real device knows
            // more registers than the catalog does.
            None => true,
        }
    }

    fn emit(&self, frame: Frame) {
        let mut bytes = frame.to_bytes();

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::DropResponse) => {
                trace!("emulator dropping response");
                return;
            }
            Some(Fault::CorruptCrc) => {
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
            }
            Some(Fault::Nack(code)) => {
                let echoed = if frame.is_status() {
                    frame.payload.first().copied().unwrap_or(frame.command)
                } else {
                    frame.command
                };
                bytes = nack(echoed, code).to_bytes();
            }
            Some(Fault::GarbagePrefix(mut garbage)) => {
                garbage.extend_from_slice(&bytes);
                bytes = garbage;
            }
            None => {}
        }

        {
            let mut stats = self.stats.write();
            stats.bytes_received += bytes.len() as u64;
            stats.reads += 1;
        }
        let _ = self.events.send(TransportEvent::Data(Bytes::from(bytes)));
    }
}

fn ack(command: u8) -> Frame {
    Frame {
        command: STATUS_ACK,
        payload: vec![command],
    }
}

fn nack(command: u8, error_code: u8) -> Frame {
    Frame {
        command: STATUS_NACK,
        payload: vec![command, error_code],
    }
}

/// Handle for inspecting and steering an [`EmulatorLink`] from tests
#[derive(Clone)]
pub struct EmulatorHandle {
    shared: Arc<EmulatorShared>,
}

impl EmulatorHandle {
    /// Set a raw register word
    pub fn set_register(&self, address: u16, value: u16) {
        self.shared.bank.lock().insert(address, value);
    }

    /// Read a raw register word back
    pub fn register(&self, address: u16) -> u16 {
        self.shared.read_word(address)
    }

    /// Store an f32 across two consecutive registers, low word first
    pub fn set_float(&self, address: u16, value: f32) {
        let bits = value.to_bits();
        let mut bank = self.shared.bank.lock();
        bank.insert(address, (bits & 0xFFFF) as u16);
        bank.insert(address + 1, (bits >> 16) as u16);
    }

    /// Queue a fault applied to the next response
    pub fn inject(&self, fault: Fault) {
        self.shared.faults.lock().push_back(fault);
    }

    /// Simulate abrupt link loss
    pub fn kill_link(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let _ = self
            .shared
            .events
            .send(TransportEvent::Error("link lost".to_string()));
        let _ = self.shared.events.send(TransportEvent::Closed);
    }

    /// Push raw bytes to the host as if the device had sent them
    pub fn push_raw(&self, bytes: &[u8]) {
        let _ = self
            .shared
            .events
            .send(TransportEvent::Data(Bytes::copy_from_slice(bytes)));
    }
}

/// Transport backed by the in-process emulator
pub struct EmulatorLink {
    shared: Arc<EmulatorShared>,
}

impl EmulatorLink {
    /// Create an emulator with the default register bank
    pub fn new() -> Self {
        Self::with_jitter(false)
    }

    /// Create an emulator; with jitter, telemetry wobbles between polls
    pub fn with_jitter(jitter: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(EmulatorShared {
            events,
            bank: Mutex::new(default_bank()),
            reassembler: Mutex::new(StreamReassembler::new()),
            faults: Mutex::new(VecDeque::new()),
            stats: RwLock::new(TransportStats::default()),
            open: AtomicBool::new(false),
            jitter,
        });
        Self { shared }
    }

    /// Handle for steering the emulator from tests
    pub fn handle(&self) -> EmulatorHandle {
        EmulatorHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for EmulatorLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BmsTransport for EmulatorLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.shared.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.open.store(false, Ordering::SeqCst);
        let _ = self.shared.events.send(TransportEvent::Closed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }

        {
            let mut stats = self.shared.stats.write();
            stats.bytes_sent += data.len() as u64;
            stats.writes += 1;
        }

        let requests = self.shared.reassembler.lock().feed(data);
        for request in requests {
            if let Some(response) = self.shared.respond(&request) {
                self.shared.emit(response);
            }
        }
        Ok(data.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn stats(&self) -> TransportStats {
        *self.shared.stats.read()
    }

    fn connection_info(&self) -> String {
        "emulated TinyBMS".to_string()
    }
}

fn default_bank() -> HashMap<u16, u16> {
    let mut bank = HashMap::new();

    // Cell voltages, mildly unbalanced
    for i in 0u16..16 {
        bank.insert(i, 3300 + i * 2);
    }
    bank.insert(40, 3300);
    bank.insert(41, 3330);

    // Pack voltage / current as IEEE-754 words
    let volts = 26.4f32.to_bits();
    bank.insert(36, (volts & 0xFFFF) as u16);
    bank.insert(37, (volts >> 16) as u16);
    let amps = (-4.2f32).to_bits();
    bank.insert(38, (amps & 0xFFFF) as u16);
    bank.insert(39, (amps >> 16) as u16);

    // Temperatures (0.1 °C), sensor 2 disconnected
    bank.insert(48, 254);
    bank.insert(42, 215);
    bank.insert(43, 0x8000);

    // SOH / SOC
    bank.insert(45, 48_000);
    let soc: u32 = 87_650_000;
    bank.insert(46, (soc & 0xFFFF) as u16);
    bank.insert(47, (soc >> 16) as u16);

    // Status and balancing
    bank.insert(50, 0x91);
    bank.insert(51, 0);
    bank.insert(52, 0);

    // Lifetime counter and distance
    bank.insert(32, 0x9C40);
    bank.insert(33, 0x0001);
    bank.insert(100, 0x4B12);
    bank.insert(101, 0x0000);

    // Configuration defaults
    for (address, value) in [
        (0x012Cu16, 3650u16),
        (0x012D, 3250),
        (0x012F, 3400),
        (0x0130, 1000),
        (0x0131, 70),
        (0x0132, 31_400),
        (0x0133, 16),
        (0x0134, 15),
        (0x0136, 20),
        (0x0137, 5),
        (0x013B, 3800),
        (0x013C, 2800),
        (0x013D, 65),
        (0x013E, 90),
        (0x013F, 60),
        (0x0140, 0),
        (0x0141, 80),
        (0x0142, 5000),
        (0x0156, 0),
        (0x0157, 1),
    ] {
        bank.insert(address, value);
    }

    bank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::frame;

    async fn request(link: &mut EmulatorLink, frame: Frame) -> Vec<Frame> {
        let mut rx = link.subscribe();
        link.send(&frame.to_bytes()).await.expect("send ok");
        let mut reassembler = StreamReassembler::new();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Data(bytes) = event {
                out.extend(reassembler.feed(&bytes));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_read_individual_round() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();

        let responses = request(&mut link, Frame::read_individual(0x012C)).await;
        assert_eq!(responses.len(), 1);
        let (address, value) = frame::parse_read_individual(&responses[0]).unwrap();
        assert_eq!((address, value), (0x012C, 3650));
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();

        let responses = request(&mut link, Frame::write_individual(0x013B, 3700)).await;
        assert_eq!(
            frame::parse_ack(&responses[0]).unwrap(),
            frame::AckNack::Ack {
                command: Command::WriteIndividual as u8
            }
        );
        assert_eq!(link.handle().register(0x013B), 3700);
    }

    #[tokio::test]
    async fn test_write_read_only_is_nacked() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();

        let responses = request(&mut link, Frame::write_individual(50, 1)).await;
        assert_eq!(
            frame::parse_ack(&responses[0]).unwrap(),
            frame::AckNack::Nack {
                command: Command::WriteIndividual as u8,
                error_code: ERR_ILLEGAL_REGISTER
            }
        );
    }

    #[tokio::test]
    async fn test_fault_drop_produces_no_response() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();
        link.handle().inject(Fault::DropResponse);

        let responses = request(&mut link, Frame::read_individual(0x012C)).await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_fault_corrupt_crc_is_unparseable() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();
        link.handle().inject(Fault::CorruptCrc);

        let responses = request(&mut link, Frame::read_individual(0x012C)).await;
        // The reassembler swallows the corrupt frame
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_split_request_across_sends() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();
        let mut rx = link.subscribe();

        let bytes = Frame::read_individual(0x012C).to_bytes();
        link.send(&bytes[..3]).await.unwrap();
        assert!(rx.try_recv().is_err());
        link.send(&bytes[3..]).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Data(_))));
    }

    #[tokio::test]
    async fn test_modbus_read_is_big_endian() {
        let mut link = EmulatorLink::new();
        link.open().await.unwrap();
        link.handle().set_register(0x0100, 0x1234);

        let responses =
            request(&mut link, Frame::modbus_read(0x0100, 1).unwrap()).await;
        let words = frame::parse_modbus_read(&responses[0]).unwrap();
        assert_eq!(words, vec![0x1234]);
        // Raw payload carries the register big-endian
        assert_eq!(&responses[0].payload, &[0x02, 0x12, 0x34]);
    }
}
