//! Serial port transport for modem interfaces.
//!
//! [`SerialTransport`] implements the [`Transport`] trait on top of
//! `tokio-serial`. Modem control ports are almost always USB virtual serial
//! devices where the line settings are ignored by the device, but physical
//! UART-attached modules (M.2 cards on embedded boards) do care, so the
//! full set is configurable through [`SerialConfig`].

use async_trait::async_trait;
use mmlib_core::error::{Error, Result};
use mmlib_core::transport::Transport;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial line configuration.
///
/// The default matches what modem firmware expects on its AT ports:
/// 115200 baud, 8N1, no flow control, DTR asserted.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Assert DTR after opening. Many modems ignore AT commands while DTR
    /// is low.
    pub assert_dtr: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            assert_dtr: true,
        }
    }
}

impl SerialConfig {
    /// Default settings at the given baud rate.
    pub fn with_baud(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// A modem device node opened as an async serial stream.
pub struct SerialTransport {
    stream: Option<SerialStream>,
    device: String,
}

impl SerialTransport {
    /// Open `device` at `baud_rate` with otherwise default settings.
    pub async fn open(device: &str, baud_rate: u32) -> Result<Self> {
        Self::open_with_config(device, SerialConfig::with_baud(baud_rate)).await
    }

    /// Open `device` with full control over the line settings.
    pub async fn open_with_config(device: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            device = %device,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "opening serial device"
        );

        let mut stream = tokio_serial::new(device, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(device = %device, error = %e, "could not open serial device");
                Error::Transport(format!("could not open {device}: {e}"))
            })?;

        if config.assert_dtr {
            if let Err(e) = stream.write_data_terminal_ready(true) {
                tracing::warn!(device = %device, error = %e, "could not assert DTR");
            }
        }

        tracing::info!(device = %device, baud_rate = config.baud_rate, "serial device open");

        Ok(Self {
            stream: Some(stream),
            device: device.to_string(),
        })
    }

    /// The device path this transport was opened on.
    pub fn device(&self) -> &str {
        &self.device
    }
}

/// Hangups on USB serial nodes show up as one of these when the modem
/// resets or is unplugged.
fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            Error::ConnectionLost
        }
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(device = %self.device, bytes = data.len(), "write");

        stream.write_all(data).await.map_err(|e| {
            tracing::error!(device = %self.device, error = %e, "write failed");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::debug!(device = %self.device, "serial device hung up");
                Ok(0)
            }
            Ok(Ok(n)) => {
                tracing::trace!(device = %self.device, bytes = n, "read");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(device = %self.device, error = %e, "read failed");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.flush().await {
                tracing::warn!(device = %self.device, error = %e, "flush before close failed");
            }
            // Dropping DTR tells the modem the host side went away.
            let _ = stream.write_data_terminal_ready(false);
            tracing::info!(device = %self.device, "serial device closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
