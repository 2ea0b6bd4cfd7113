//! Transport to the instrument.
//!
//! The instrument is reached over a USB serial bridge, found by vendor id.
//! When no such port exists the simulator's TCP address is tried instead.

use crate::config::ControllerConfig;
use crate::error::{InstrumentError, Result};
use std::time::Duration;
use stimlink_shared::protocol::{MAGIC_WORD, MAGIC_WORD_LENGTH, MAX_FULL_PACKET_LENGTH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info, warn};

/// Delay between polls when the transport has nothing to read.
pub const EMPTY_READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bytes that may be discarded while looking for the first magic word.
pub const MAX_RESYNC_DISCARD: usize = MAX_FULL_PACKET_LENGTH - MAGIC_WORD_LENGTH;

const VIRTUAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Any byte stream the engine can talk over.
pub trait InstrumentLink: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> InstrumentLink for T {}

/// An open transport and where it leads.
pub struct Connection {
    pub link: Box<dyn InstrumentLink>,
    pub port: String,
    pub is_virtual: bool,
}

impl Connection {
    pub fn new(link: impl InstrumentLink + 'static, port: impl Into<String>, is_virtual: bool) -> Self {
        Self {
            link: Box::new(link),
            port: port.into(),
            is_virtual,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .field("is_virtual", &self.is_virtual)
            .finish()
    }
}

/// Name of the first serial port whose USB vendor id matches.
pub fn find_serial_port(vendor_id: u16) -> Option<String> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Failed to enumerate serial ports: {}", e);
            return None;
        }
    };
    ports.into_iter().find_map(|port| match port.port_type {
        SerialPortType::UsbPort(usb) if usb.vid == vendor_id => Some(port.port_name),
        _ => None,
    })
}

fn open_serial(path: &str, baud_rate: u32) -> Result<Connection> {
    let stream = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;
    info!("Connected to instrument on serial port {}", path);
    Ok(Connection::new(stream, path, false))
}

/// Open the serial port (explicit, or probed by vendor id), else the virtual instrument.
pub async fn connect(config: &ControllerConfig) -> Result<Connection> {
    let serial = config
        .serial_port
        .clone()
        .or_else(|| find_serial_port(config.vendor_id));

    if let Some(path) = serial {
        match open_serial(&path, config.baud_rate) {
            Ok(connection) => return Ok(connection),
            Err(e) => warn!("Failed to open serial port {}: {}", path, e),
        }
    } else {
        debug!(
            "No serial port with vendor id {:#06x}, trying virtual instrument",
            config.vendor_id
        );
    }

    match tokio::time::timeout(
        VIRTUAL_CONNECT_TIMEOUT,
        TcpStream::connect(&config.virtual_address),
    )
    .await
    {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            info!("Connected to virtual instrument at {}", config.virtual_address);
            Ok(Connection::new(stream, config.virtual_address.clone(), true))
        }
        Ok(Err(e)) => {
            debug!("Virtual instrument unavailable: {}", e);
            Err(InstrumentError::NoInstrumentDetected)
        }
        Err(_) => Err(InstrumentError::NoInstrumentDetected),
    }
}

/// Discard bytes until the stream is aligned on a magic word.
///
/// Returns every byte read from the magic word onward. Fails once more than
/// [`MAX_RESYNC_DISCARD`] bytes have been discarded, or when `timeout`
/// passes first.
pub async fn resynchronize<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut window: Vec<u8> = Vec::with_capacity(1024);
    let mut discarded = 0usize;
    let mut buf = [0u8; 1024];

    loop {
        if let Some(pos) = window
            .windows(MAGIC_WORD_LENGTH)
            .position(|candidate| candidate == MAGIC_WORD)
        {
            discarded += pos;
            if discarded > MAX_RESYNC_DISCARD {
                return Err(InstrumentError::MagicWordSearchExhausted(discarded));
            }
            if discarded > 0 {
                debug!(discarded, "Discarded bytes before magic word");
            }
            return Ok(window.split_off(pos));
        }

        // keep a tail that could still start a magic word
        if window.len() >= MAGIC_WORD_LENGTH {
            let drop = window.len() - (MAGIC_WORD_LENGTH - 1);
            discarded += drop;
            window.drain(..drop);
        }
        if discarded > MAX_RESYNC_DISCARD {
            return Err(InstrumentError::MagicWordSearchExhausted(discarded));
        }

        let n = match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Err(InstrumentError::MagicWordTimeout(timeout)),
        };
        if n == 0 {
            if Instant::now() >= deadline {
                return Err(InstrumentError::MagicWordTimeout(timeout));
            }
            tokio::time::sleep(EMPTY_READ_POLL_INTERVAL).await;
            continue;
        }
        window.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stimlink_shared::protocol::encode_packet;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_secs(8);

    async fn resync_over(bytes: Vec<u8>) -> Result<Vec<u8>> {
        let (mut device, mut host) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            let _ = device.write_all(&bytes).await;
            device
        });
        let result = resynchronize(&mut host, TIMEOUT).await;
        drop(host);
        let _ = writer.await;
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_aligned_stream() {
        let packet = encode_packet(1, 0, &[0; 26]).unwrap();
        let aligned = resync_over(packet.clone()).await.unwrap();
        assert!(aligned.starts_with(MAGIC_WORD));
        assert!(packet.starts_with(&aligned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_garbage_is_accepted() {
        let packet = encode_packet(1, 0, &[0; 26]).unwrap();
        let mut stream = vec![0xAA; MAX_RESYNC_DISCARD];
        stream.extend_from_slice(&packet);
        let aligned = resync_over(stream).await.unwrap();
        assert!(aligned.starts_with(MAGIC_WORD));
        assert!(packet.starts_with(&aligned[..aligned.len().min(packet.len())]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_magic_word_in_garbage() {
        let packet = encode_packet(1, 0, &[]).unwrap();
        let mut stream = b"CURI BI".to_vec();
        stream.extend_from_slice(b"xx");
        stream.extend_from_slice(&packet);
        let aligned = resync_over(stream).await.unwrap();
        assert!(aligned.starts_with(MAGIC_WORD));
        assert!(packet.starts_with(&aligned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_exhausted() {
        let mut stream = vec![0x55; MAX_RESYNC_DISCARD + 1];
        stream.extend_from_slice(MAGIC_WORD);
        assert!(matches!(
            resync_over(stream).await,
            Err(InstrumentError::MagicWordSearchExhausted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let (_device, mut host) = tokio::io::duplex(1024);
        assert!(matches!(
            resynchronize(&mut host, TIMEOUT).await,
            Err(InstrumentError::MagicWordTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_virtual_fallback_fails_without_listener() {
        let config = ControllerConfig {
            serial_port: None,
            vendor_id: 0xfffe,
            virtual_address: "127.0.0.1:9".to_string(),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            connect(&config).await,
            Err(InstrumentError::NoInstrumentDetected)
        ));
    }
}
