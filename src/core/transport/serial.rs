//! Serial port transport
//!
//! Wraps a `tokio-serial` stream: the write half stays with the transport,
//! a spawned task drains the read half and broadcasts received bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::{BmsTransport, TransportError, TransportEvent, TransportStats};
use crate::config::SerialSettings;

const READ_CHUNK: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// UART transport for the TinyBMS link
pub struct SerialLink {
    settings: SerialSettings,
    writer: Option<WriteHalf<SerialStream>>,
    reader_task: Option<JoinHandle<()>>,
    events: broadcast::Sender<TransportEvent>,
    stats: Arc<RwLock<TransportStats>>,
}

impl SerialLink {
    /// Create a transport for the given port settings (not yet open)
    pub fn new(settings: SerialSettings) -> Result<Self, TransportError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            settings,
            writer: None,
            reader_task: None,
            events,
            stats: Arc::new(RwLock::new(TransportStats::default())),
        })
    }

    fn spawn_reader(&mut self, mut reader: ReadHalf<SerialStream>) {
        let events = self.events.clone();
        let stats = self.stats.clone();

        self.reader_task = Some(tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) => {
                        debug!("serial port closed by peer");
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        {
                            let mut stats = stats.write();
                            stats.bytes_received += n as u64;
                            stats.reads += 1;
                        }
                        let _ = events.send(TransportEvent::Data(Bytes::copy_from_slice(
                            &buffer[..n],
                        )));
                    }
                    Err(err) => {
                        warn!(error = %err, "serial read failed");
                        let _ = events.send(TransportEvent::Error(err.to_string()));
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl BmsTransport for SerialLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.writer.is_some() {
            return Ok(());
        }

        let stream = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(self.settings.data_bits())
            .stop_bits(self.settings.stop_bits())
            .parity(self.settings.parity())
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|err| match err.kind {
                tokio_serial::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.settings.port.clone())
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.settings.port.clone())
                }
                _ => TransportError::ConnectionFailed(err.to_string()),
            })?;

        let (reader, writer) = tokio::io::split(stream);
        self.writer = Some(writer);
        *self.stats.write() = TransportStats::default();
        self.spawn_reader(reader);

        debug!(port = %self.settings.port, baud = self.settings.baud_rate, "serial link open");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        let _ = self.events.send(TransportEvent::Closed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.writes += 1;
        Ok(data.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn stats(&self) -> TransportStats {
        *self.stats.read()
    }

    fn connection_info(&self) -> String {
        format!("{} @ {} baud", self.settings.port, self.settings.baud_rate)
    }
}

/// List serial ports present on the system
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}
