//! Line-oriented transports for the Sirah Matisse controller.
//!
//! Protocol Overview:
//! - Format: ASCII command/response
//! - Baud: 115200, 8N1, no flow control
//! - Command terminator: CR+LF (\r\n)
//! - Response terminator: LF (\n)
//!
//! [`SerialTransport`] wraps any `AsyncRead + AsyncWrite` stream, so the same
//! code drives a serial port, a TCP bridge or an in-memory duplex pipe.
//!
//! # Usage
//!
//! ```rust,ignore
//! use matisse_driver_serial::SerialTransport;
//! use matisse_core::InstrumentLink;
//!
//! let transport = SerialTransport::open("/dev/ttyUSB0", 115_200, Duration::from_secs(5)).await?;
//! let link = InstrumentLink::open(Box::new(transport)).await?;
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use matisse_core::Transport;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, instrument};

/// Byte stream usable as a Matisse link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
type DynSerial = Box<dyn SerialPortIO>;

/// Transport sending CR+LF terminated commands and reading LF terminated
/// responses.
pub struct SerialTransport {
    port: BufReader<DynSerial>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened. No command is sent;
    /// `InstrumentLink::open` validates the instrument afterwards.
    pub async fn open(port_path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port_path_owned = port_path.to_string();

        // Use spawn_blocking to avoid blocking the async runtime
        let port = spawn_blocking(move || {
            tokio_serial::new(&port_path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .context(format!(
                    "Failed to open Matisse serial port: {}",
                    port_path_owned
                ))
        })
        .await
        .context("spawn_blocking for Matisse port opening failed")??;

        debug!(port = port_path, baud_rate, "Opened Matisse serial port");
        Ok(Self::from_stream(Box::new(port), port_path, timeout))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: DynSerial, name: &str, timeout: Duration) -> Self {
        Self {
            port: BufReader::new(stream),
            name: name.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    #[instrument(skip(self), fields(port = %self.name), err)]
    async fn exchange(&mut self, command: &str) -> Result<String> {
        let cmd = format!("{}\r\n", command);
        self.port
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .context("Matisse write failed")?;
        self.port
            .get_mut()
            .flush()
            .await
            .context("Matisse flush failed")?;

        let mut response = String::new();
        let read = tokio::time::timeout(self.timeout, self.port.read_line(&mut response))
            .await
            .context("Matisse read timeout")??;
        if read == 0 {
            return Err(anyhow!("Matisse closed the connection"));
        }

        Ok(response.trim().to_string())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn exchange_terminates_command_and_trims_response() -> Result<()> {
        let (host, mut device) = tokio::io::duplex(64);
        let mut transport =
            SerialTransport::from_stream(Box::new(host), "duplex", Duration::from_secs(1));

        let device_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = device.read(&mut buf).await.unwrap();
            device.write_all(b"MOTBI:WL 780.25\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let response = transport.exchange("MOTBI:WL?").await?;
        assert_eq!(response, "MOTBI:WL 780.25");
        assert_eq!(device_task.await?, "MOTBI:WL?\r\n");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (host, _device) = tokio::io::duplex(64);
        let mut transport =
            SerialTransport::from_stream(Box::new(host), "duplex", Duration::from_secs(2));

        let err = transport.exchange("FPZT:LOCK?").await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn closed_stream_is_an_error() {
        let (host, device) = tokio::io::duplex(64);
        drop(device);
        let mut transport =
            SerialTransport::from_stream(Box::new(host), "duplex", Duration::from_secs(1));
        assert!(transport.exchange("ERROR:CLEAR").await.is_err());
    }

    #[test]
    fn describe_reports_port_name() {
        let (host, _device) = tokio::io::duplex(8);
        let transport =
            SerialTransport::from_stream(Box::new(host), "/dev/ttyUSB0", Duration::from_secs(1));
        assert_eq!(transport.describe(), "/dev/ttyUSB0");
    }
}
