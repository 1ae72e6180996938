//! Graceful power-down that waits for the modem to confirm.
//!
//! Quectel modems acknowledge `AT+QPOWD=1` with `OK` right away and only
//! report `POWERED DOWN` once the module is actually off, up to a minute
//! later. The URC handler is registered before the command goes out so a
//! confirmation arriving in the same read as the `OK` is not lost.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use mmlib_at_io::AtPort;
use mmlib_core::error::{Error, Result};

use crate::modem::BaseModem;

/// A power-down command plus the URC that confirms it.
#[derive(Debug, Clone, Copy)]
pub struct PowerDown {
    pub command: &'static str,
    pub command_timeout: Duration,
    /// Regex matched against unsolicited output.
    pub urc_pattern: &'static str,
    /// How long to wait for the URC once the command succeeded.
    pub urc_timeout: Duration,
}

impl Default for PowerDown {
    fn default() -> Self {
        PowerDown {
            command: "+QPOWD=1",
            command_timeout: Duration::from_secs(5),
            urc_pattern: r"\r\nPOWERED DOWN\r\n",
            urc_timeout: Duration::from_secs(62),
        }
    }
}

/// Removes the confirmation handler however `run` ends.
struct HandlerGuard<'a> {
    port: &'a AtPort,
    pattern: &'static str,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.port.remove_unsolicited_handler(self.pattern);
    }
}

impl PowerDown {
    /// Power `modem` off on its best AT port.
    ///
    /// Fails with the command's error if the modem rejects it, and with
    /// [`Error::Timeout`] if the confirmation never arrives.
    pub async fn run(&self, modem: &BaseModem) -> Result<()> {
        let port = modem.best_at_port()?;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        port.add_unsolicited_handler(self.urc_pattern, move |_| {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(());
            }
            Ok(())
        })?;
        let _guard = HandlerGuard {
            port,
            pattern: self.urc_pattern,
        };

        modem
            .at_command_full(port, self.command, self.command_timeout, false, false, None)
            .await?;
        debug!(device = %modem.device(), "waiting for power down confirmation");

        tokio::select! {
            confirmed = rx => confirmed.map_err(|_| Error::ConnectionLost),
            _ = tokio::time::sleep(self.urc_timeout) => {
                warn!(device = %modem.device(), "no power down confirmation");
                Err(Error::Timeout)
            }
            _ = modem.cancellation().cancelled() => Err(Error::Cancelled),
        }
    }
}
