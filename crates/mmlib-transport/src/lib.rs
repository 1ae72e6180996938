//! Transport implementations for mmlib.
//!
//! Cellular modems expose their AT and NMEA interfaces as USB CDC-ACM or
//! vendor serial device nodes (`/dev/ttyUSB*`, `/dev/ttyACM*`). This crate
//! provides [`SerialTransport`], the [`Transport`](mmlib_core::Transport)
//! implementation for those nodes.
//!
//! # Example
//!
//! ```no_run
//! use mmlib_transport::SerialTransport;
//! use mmlib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> mmlib_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB2", 115200).await?;
//! transport.send(b"ATI\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
