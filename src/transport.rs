//! Byte-stream transports.
//!
//! A [`Transport`] turns a configured address into an opened bidirectional
//! byte stream. Two address forms are recognised:
//!
//! - a path starting with `/` opens a serial port at 9600-8-N-1;
//! - `tcp://host:port` (or a bare `host:port`) opens a TCP connection.
//!
//! Everything above this layer works against `Box<dyn ByteStream>`, so tests
//! can substitute in-memory duplex pipes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;

/// Object-safe alias for anything readable and writable.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Factory producing connected byte streams. The commander dials through this
/// trait so tests can inject scripted connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>>;
}

const SERIAL_BAUD_RATE: u32 = 9600;

/// Production transport dialling serial ports and TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTcpTransport;

#[async_trait]
impl Transport for SerialTcpTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>> {
        if address.starts_with('/') {
            debug!("opening serial port {}", address);
            let stream = tokio_serial::new(address, SERIAL_BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .stop_bits(tokio_serial::StopBits::One)
                .parity(tokio_serial::Parity::None)
                .open_native_async()
                .map_err(|err| Error::Transport(format!("{}: {}", address, err)))?;
            return Ok(Box::new(stream));
        }

        let host_port = address.strip_prefix("tcp://").unwrap_or(address);
        debug!("connecting to {}", host_port);
        let stream = TcpStream::connect(host_port).await?;
        Ok(Box::new(stream))
    }
}
