//! BaseModem -- the object vendor code runs AT commands through.
//!
//! A [`BaseModem`] owns the ports grabbed for one device, the modem-wide
//! cancellation token that is fired when the device goes away, and the
//! [`FeatureCache`]. Single commands and [sequences](crate::sequence) are
//! routed to the best AT port: the primary one, else the secondary one.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mmlib_at_io::AtPortBuilder;
//! use mmlib_core::PortFlags;
//! use mmlib_modem::BaseModem;
//!
//! # async fn example() -> mmlib_core::Result<()> {
//! let primary = AtPortBuilder::new()
//!     .device("/dev/ttyUSB2")
//!     .flags(PortFlags::PRIMARY)
//!     .build()
//!     .await?;
//! let modem = BaseModem::builder("usb-1-1").port(primary).build()?;
//! let model = modem.at_command("+CGMM", Duration::from_secs(3), true).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use mmlib_at_io::{AtCommand, AtPort};
use mmlib_core::error::{Error, Result};
use mmlib_core::types::{FeatureSupport, PortFlags, PortKind};

use crate::feature::FeatureCache;
use crate::sequence::{ProcessorResult, SequenceCommand};

/// Timeout used for feature probe commands.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One modem and the ports it owns.
#[derive(Debug)]
pub struct BaseModem {
    device: String,
    ports: Vec<AtPort>,
    gps: Option<AtPort>,
    features: FeatureCache,
    cancel: CancellationToken,
}

impl BaseModem {
    pub fn builder(device: &str) -> BaseModemBuilder {
        BaseModemBuilder::new(device)
    }

    /// Physical device identifier the ports were grabbed for.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn ports(&self) -> &[AtPort] {
        &self.ports
    }

    pub fn primary_port(&self) -> Option<&AtPort> {
        self.port_with(PortFlags::PRIMARY)
    }

    pub fn secondary_port(&self) -> Option<&AtPort> {
        self.port_with(PortFlags::SECONDARY)
    }

    fn port_with(&self, flag: PortFlags) -> Option<&AtPort> {
        self.ports.iter().find(|p| p.flags().contains(flag))
    }

    /// The port AT commands go to when the caller does not pick one.
    pub fn best_at_port(&self) -> Result<&AtPort> {
        self.primary_port()
            .or_else(|| self.secondary_port())
            .or_else(|| self.ports.first())
            .ok_or(Error::NotConnected)
    }

    /// Port carrying the raw NMEA stream, if the device has one.
    pub fn gps_port(&self) -> Option<&AtPort> {
        self.gps.as_ref()
    }

    pub fn features(&self) -> &FeatureCache {
        &self.features
    }

    /// Token fired when the modem is torn down. Every command run through
    /// the modem is cancelled with it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel everything in flight and close all ports.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        for port in self.ports.iter().chain(self.gps.as_ref()) {
            port.close().await?;
        }
        debug!(device = %self.device, "modem shut down");
        Ok(())
    }

    /// Run `command` on the best AT port.
    pub async fn at_command(&self, command: &str, timeout: Duration, allow_cached: bool) -> Result<String> {
        let port = self.best_at_port()?;
        self.at_command_full(port, command, timeout, allow_cached, false, None)
            .await
    }

    /// Run `command` on `port`.
    ///
    /// The port is opened (without its init sequence) if it is closed. The
    /// command is cancelled when `cancel` fires or when the modem is torn
    /// down, whichever comes first.
    pub async fn at_command_full(
        &self,
        port: &AtPort,
        command: &str,
        timeout: Duration,
        allow_cached: bool,
        is_raw: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let token = self.cancel.child_token();
        if cancel.is_some_and(CancellationToken::is_cancelled) || token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        setup_port(port).await?;

        let reply = port.queue_command(
            AtCommand::new(command)
                .timeout(timeout)
                .allow_cached(allow_cached)
                .raw(is_raw)
                .cancellable(token.clone()),
        );
        let result = match cancel {
            Some(user) => {
                tokio::select! {
                    result = reply => result,
                    _ = user.cancelled() => {
                        token.cancel();
                        Err(Error::Cancelled)
                    }
                }
            }
            None => reply.await,
        };

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        result
    }

    /// Run a command sequence on the best AT port.
    pub async fn at_sequence(&self, sequence: &[SequenceCommand<'_>]) -> Result<Option<String>> {
        let port = self.best_at_port()?;
        self.at_sequence_full(port, sequence, None).await
    }

    /// Run `sequence` on `port`.
    ///
    /// Completes with the result of the first processor that returns
    /// [`ProcessorResult::Success`], the error of the first one that returns
    /// [`ProcessorResult::Failure`], or `None` if every processor asked to
    /// continue.
    pub async fn at_sequence_full(
        &self,
        port: &AtPort,
        sequence: &[SequenceCommand<'_>],
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        for (i, entry) in sequence.iter().enumerate() {
            if i > 0 && !entry.wait.is_zero() {
                let token = self.cancel.child_token();
                tokio::select! {
                    _ = tokio::time::sleep(entry.wait) => {}
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = user_cancelled(cancel) => return Err(Error::Cancelled),
                }
            }

            let reply = self
                .at_command_full(port, entry.command, entry.timeout, entry.allow_cached, false, cancel)
                .await;
            if matches!(reply, Err(Error::Cancelled)) {
                return Err(Error::Cancelled);
            }

            let Some(processor) = entry.processor else {
                continue;
            };
            let last = i + 1 == sequence.len();
            match processor(entry.command, reply, last) {
                ProcessorResult::Continue => continue,
                ProcessorResult::Success(result) => return Ok(result),
                ProcessorResult::Failure(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Probe `feature` with `command` (cached reply allowed) unless its
    /// state is already known.
    pub async fn probe_feature(&self, feature: &str, command: &str) -> FeatureSupport {
        self.features
            .get_or_probe(feature, || self.at_command(command, PROBE_TIMEOUT, true))
            .await
    }
}

async fn user_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Open `port` for a command if nobody has yet, keeping its init sequence
/// for later opens.
async fn setup_port(port: &AtPort) -> Result<()> {
    if port.is_open() {
        return Ok(());
    }
    let init = port.init_sequence_enabled();
    port.set_init_sequence_enabled(false);
    let opened = port.open().await;
    port.set_init_sequence_enabled(init);
    opened
}

/// Fluent builder for [`BaseModem`].
#[derive(Debug)]
pub struct BaseModemBuilder {
    device: String,
    ports: Vec<AtPort>,
    gps: Option<AtPort>,
}

impl BaseModemBuilder {
    pub fn new(device: &str) -> Self {
        BaseModemBuilder {
            device: device.to_string(),
            ports: Vec::new(),
            gps: None,
        }
    }

    /// Grab a port of the given kind. AT ports keep their [`PortFlags`]
    /// role; a second GPS port replaces the first.
    pub fn grab_port(mut self, kind: PortKind, port: AtPort) -> Self {
        debug!(device = %self.device, port = %port.device(), %kind, "grabbed port");
        match kind {
            PortKind::At => self.ports.push(port),
            PortKind::Gps => self.gps = Some(port),
        }
        self
    }

    /// Grab an AT port. Its [`PortFlags`] decide the primary/secondary role.
    pub fn port(self, port: AtPort) -> Self {
        self.grab_port(PortKind::At, port)
    }

    /// Grab the NMEA data port.
    pub fn gps_port(self, port: AtPort) -> Self {
        self.grab_port(PortKind::Gps, port)
    }

    pub fn build(self) -> Result<BaseModem> {
        if self.ports.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "modem {} has no AT port",
                self.device
            )));
        }
        Ok(BaseModem {
            device: self.device,
            ports: self.ports,
            gps: self.gps,
            features: FeatureCache::new(),
            cancel: CancellationToken::new(),
        })
    }
}
