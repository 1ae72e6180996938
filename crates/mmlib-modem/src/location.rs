//! Location gathering through a modem's embedded GPS engine.
//!
//! [`LocationGathering`] is the capability seam. [`GenericLocation`] is the
//! implementation every 3GPP modem gets (serving cell LAC/CI, no commands
//! needed). [`EngineGpsLocation`] wraps a parent implementation and adds the
//! GPS sources for modems that drive their engine with either `AT^SGPSS`
//! (single command) or `AT^SGPSC` (separate output, antenna and engine
//! settings). When neither is supported every request goes to the parent.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mmlib_at_io::{AtCommand, UnsolicitedMatch};
use mmlib_core::error::{Error, Result};
use mmlib_core::types::FeatureSupport;

use crate::modem::BaseModem;
use crate::steps::{SequenceContext, StepMachine, Transition, run_steps};

bitflags::bitflags! {
    /// Location sources a modem can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LocationSources: u32 {
        /// Serving cell location area code and cell id.
        const THREE_GPP_LAC_CI = 1 << 0;
        /// Parsed GPS fixes.
        const GPS_RAW = 1 << 1;
        /// NMEA traces.
        const GPS_NMEA = 1 << 2;
        /// Engine started, data consumed by someone else.
        const GPS_UNMANAGED = 1 << 3;
    }
}

impl LocationSources {
    /// All GPS-backed sources.
    pub const GPS: LocationSources = LocationSources::GPS_RAW
        .union(LocationSources::GPS_NMEA)
        .union(LocationSources::GPS_UNMANAGED);

    /// Sources that read the NMEA data port.
    pub const GPS_DATA: LocationSources = LocationSources::GPS_RAW.union(LocationSources::GPS_NMEA);
}

/// Location capability of a modem.
#[async_trait]
pub trait LocationGathering: Send + Sync {
    /// Sources this modem can provide.
    async fn load_capabilities(&self) -> Result<LocationSources>;

    /// Start gathering `source`.
    async fn enable_gathering(&self, source: LocationSources) -> Result<()>;

    /// Stop gathering `source`.
    async fn disable_gathering(&self, source: LocationSources) -> Result<()>;
}

// ---------------------------------------------------------------------------
// GenericLocation
// ---------------------------------------------------------------------------

/// Baseline location support: 3GPP LAC/CI only.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericLocation;

impl GenericLocation {
    pub fn new() -> Self {
        GenericLocation
    }
}

#[async_trait]
impl LocationGathering for GenericLocation {
    async fn load_capabilities(&self) -> Result<LocationSources> {
        Ok(LocationSources::THREE_GPP_LAC_CI)
    }

    async fn enable_gathering(&self, source: LocationSources) -> Result<()> {
        check_generic(source)
    }

    async fn disable_gathering(&self, source: LocationSources) -> Result<()> {
        check_generic(source)
    }
}

fn check_generic(source: LocationSources) -> Result<()> {
    if LocationSources::THREE_GPP_LAC_CI.contains(source) {
        Ok(())
    } else {
        Err(Error::Unsupported(format!("location source {source:?}")))
    }
}

// ---------------------------------------------------------------------------
// EngineGpsLocation
// ---------------------------------------------------------------------------

const SGPSS: &str = "sgpss";
const SGPSC: &str = "sgpsc";

const GPS_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Settling delay between GPS commands.
const GPS_STEP_DELAY: Duration = Duration::from_millis(100);

/// Settling delay before the engine is started; shorter waits get
/// `+CME ERROR: 767` on some firmware.
const GPS_ENGINE_DELAY: Duration = Duration::from_millis(2000);

/// Attempts at starting the engine before giving up.
const MAX_ENGINE_ATTEMPTS: u32 = 3;

const NMEA_TRACE: &str = r"\$G[A-Z]{4},[^\r\n]*\r?\n";

#[derive(Debug, Default)]
struct GpsState {
    /// Sources provided here rather than by the parent.
    supported: LocationSources,
    enabled: LocationSources,
}

/// GPS location through `^SGPSS` or `^SGPSC`, falling back to `parent`.
///
/// The modem's GPS data port must be built with echo removal off, since
/// NMEA sentences are CRLF-terminated lines of their own.
pub struct EngineGpsLocation<P> {
    modem: Arc<BaseModem>,
    parent: P,
    state: Mutex<GpsState>,
    nmea: broadcast::Sender<String>,
}

impl<P: LocationGathering> EngineGpsLocation<P> {
    pub fn new(modem: Arc<BaseModem>, parent: P) -> Self {
        let (nmea, _) = broadcast::channel(64);
        EngineGpsLocation {
            modem,
            parent,
            state: Mutex::new(GpsState::default()),
            nmea,
        }
    }

    fn state(&self) -> MutexGuard<'_, GpsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// NMEA sentences read from the GPS data port while gathering runs.
    pub fn subscribe_nmea(&self) -> broadcast::Receiver<String> {
        self.nmea.subscribe()
    }

    /// Sources currently enabled through the GPS engine.
    pub fn enabled_sources(&self) -> LocationSources {
        self.state().enabled
    }

    /// Fails with [`Error::Cancelled`] if either probe was cut short.
    async fn probe(&self) -> Result<(FeatureSupport, FeatureSupport)> {
        let modem = &self.modem;
        let sgpss = modem
            .features()
            .get_or_probe(SGPSS, || async {
                let reply = modem.at_command("^SGPSS=?", GPS_COMMAND_TIMEOUT, true).await?;
                // One command set only: ^SGPSC is ignored even if present.
                modem.features().set(SGPSC, false);
                // The engine may have been left running.
                self.fire_and_forget(&["^SGPSS=0"]);
                Ok(reply)
            })
            .await;

        let sgpsc = modem
            .features()
            .get_or_probe(SGPSC, || async {
                let reply = modem.at_command("^SGPSC=?", GPS_COMMAND_TIMEOUT, true).await?;
                self.fire_and_forget(&[
                    "^SGPSC=\"Engine\",\"0\"",
                    "^SGPSC=\"Power/Antenna\",\"off\"",
                    "^SGPSC=\"NMEA/Output\",\"off\"",
                ]);
                Ok(reply)
            })
            .await;

        if !sgpss.is_known() || !sgpsc.is_known() {
            return Err(Error::Cancelled);
        }
        Ok((sgpss, sgpsc))
    }

    fn fire_and_forget(&self, commands: &[&str]) {
        let Ok(port) = self.modem.best_at_port() else {
            return;
        };
        for command in commands {
            drop(port.queue_command(AtCommand::new(*command).timeout(GPS_COMMAND_TIMEOUT)));
        }
    }

    fn engine(&self) -> Result<Engine> {
        let features = self.modem.features();
        if features.get(SGPSS) == FeatureSupport::Supported {
            Ok(Engine::Sgpss)
        } else if features.get(SGPSC) == FeatureSupport::Supported {
            Ok(Engine::Sgpsc)
        } else {
            Err(Error::Unsupported("GPS engine control".into()))
        }
    }

    fn watch_nmea(&self) -> Result<()> {
        let Some(port) = self.modem.gps_port() else {
            return Ok(());
        };
        let tx = self.nmea.clone();
        port.add_unsolicited_handler(NMEA_TRACE, move |m: &UnsolicitedMatch| {
            let _ = tx.send(m.text().trim_end().to_string());
            Ok(())
        })
    }
}

#[async_trait]
impl<P: LocationGathering> LocationGathering for EngineGpsLocation<P> {
    async fn load_capabilities(&self) -> Result<LocationSources> {
        let (sgpss, sgpsc) = self.probe().await?;
        let mut sources = self.parent.load_capabilities().await?;

        if sgpss == FeatureSupport::Supported || sgpsc == FeatureSupport::Supported {
            debug!(device = %self.modem.device(), "GPS commands supported");
            let ours = LocationSources::GPS.difference(sources);
            self.state().supported |= ours;
            sources |= ours;
            self.watch_nmea()?;
        } else {
            debug!(device = %self.modem.device(), "no GPS command supported");
        }
        Ok(sources)
    }

    async fn enable_gathering(&self, source: LocationSources) -> Result<()> {
        if !self.state().supported.intersects(source) {
            return self.parent.enable_gathering(source).await;
        }

        if !self.state().enabled.intersects(LocationSources::GPS) {
            let machine = EnableGps {
                modem: Arc::clone(&self.modem),
                engine: self.engine()?,
                open_data_port: source.intersects(LocationSources::GPS_DATA),
            };
            run_steps(machine, self.modem.cancellation().child_token()).await?;
        } else if source.intersects(LocationSources::GPS_DATA) {
            open_gps_port(&self.modem).await?;
        }

        self.state().enabled |= source;
        Ok(())
    }

    async fn disable_gathering(&self, source: LocationSources) -> Result<()> {
        if !self.state().supported.intersects(source) {
            return self.parent.disable_gathering(source).await;
        }

        let remaining = self.state().enabled.difference(source);
        if remaining.intersects(LocationSources::GPS) {
            self.state().enabled = remaining;
            return Ok(());
        }

        let machine = DisableGps {
            modem: Arc::clone(&self.modem),
            engine: self.engine()?,
            close_data_port: source.intersects(LocationSources::GPS_DATA),
        };
        run_steps(machine, self.modem.cancellation().child_token()).await?;
        self.state().enabled = remaining;
        Ok(())
    }
}

async fn open_gps_port(modem: &BaseModem) -> Result<()> {
    let port = modem
        .gps_port()
        .ok_or_else(|| Error::Transport("couldn't open raw GPS serial port".into()))?;
    port.open().await
}

async fn gps_command(modem: &BaseModem, command: &str) -> Result<String> {
    modem.at_command(command, GPS_COMMAND_TIMEOUT, false).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Sgpss,
    Sgpsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpsStep {
    Sgpss,
    SgpscOutput,
    SgpscAntenna,
    SgpscEngine,
    Last,
}

struct EnableGps {
    modem: Arc<BaseModem>,
    engine: Engine,
    open_data_port: bool,
}

impl EnableGps {
    fn after(next: GpsStep) -> Transition<GpsStep, ()> {
        let after = if next == GpsStep::SgpscEngine {
            GPS_ENGINE_DELAY
        } else {
            GPS_STEP_DELAY
        };
        Transition::Next { step: next, after }
    }
}

#[async_trait]
impl StepMachine for EnableGps {
    type Step = GpsStep;
    type Output = ();

    fn first_step(&self) -> GpsStep {
        GpsStep::Sgpss
    }

    async fn run_step(&mut self, ctx: &mut SequenceContext<GpsStep>) -> Transition<GpsStep, ()> {
        let (command, next) = match (ctx.step(), self.engine) {
            (GpsStep::Sgpss, Engine::Sgpss) => ("^SGPSS=4", GpsStep::Last),
            (GpsStep::Sgpss, Engine::Sgpsc) => return Transition::next(GpsStep::SgpscOutput),
            (GpsStep::SgpscOutput, _) => ("^SGPSC=\"NMEA/Output\",\"on\"", GpsStep::SgpscAntenna),
            (GpsStep::SgpscAntenna, _) => ("^SGPSC=\"Power/Antenna\",\"on\"", GpsStep::SgpscEngine),
            (GpsStep::SgpscEngine, _) => ("^SGPSC=\"Engine\",\"1\"", GpsStep::Last),
            (GpsStep::Last, _) => {
                if self.open_data_port {
                    if let Err(e) = open_gps_port(&self.modem).await {
                        return Transition::Fail(e);
                    }
                }
                return Transition::Done(());
            }
        };

        match gps_command(&self.modem, command).await {
            Ok(_) => Self::after(next),
            Err(e) if ctx.step() == GpsStep::SgpscEngine && ctx.attempt() + 1 < MAX_ENGINE_ATTEMPTS => {
                debug!(
                    attempt = ctx.attempt() + 1,
                    max = MAX_ENGINE_ATTEMPTS,
                    error = %e,
                    "GPS engine setup failed"
                );
                Transition::Retry {
                    after: GPS_ENGINE_DELAY,
                }
            }
            Err(e) => Transition::Fail(e),
        }
    }
}

struct DisableGps {
    modem: Arc<BaseModem>,
    engine: Engine,
    close_data_port: bool,
}

#[async_trait]
impl StepMachine for DisableGps {
    type Step = GpsStep;
    type Output = ();

    fn first_step(&self) -> GpsStep {
        GpsStep::Sgpss
    }

    /// Every command runs even if an earlier one failed; the first failure
    /// is reported once the data port is closed.
    async fn run_step(&mut self, ctx: &mut SequenceContext<GpsStep>) -> Transition<GpsStep, ()> {
        let (command, next) = match (ctx.step(), self.engine) {
            (GpsStep::Sgpss, Engine::Sgpss) => ("^SGPSS=0", GpsStep::Last),
            (GpsStep::Sgpss, Engine::Sgpsc) => return Transition::next(GpsStep::SgpscEngine),
            (GpsStep::SgpscEngine, _) => ("^SGPSC=\"Engine\",\"0\"", GpsStep::SgpscAntenna),
            (GpsStep::SgpscAntenna, _) => ("^SGPSC=\"Power/Antenna\",\"off\"", GpsStep::SgpscOutput),
            (GpsStep::SgpscOutput, _) => ("^SGPSC=\"NMEA/Output\",\"off\"", GpsStep::Last),
            (GpsStep::Last, _) => {
                if self.close_data_port {
                    if let Some(port) = self.modem.gps_port() {
                        if let Err(e) = port.close().await {
                            warn!(error = %e, "closing GPS data port failed");
                        }
                    }
                }
                return Transition::Done(());
            }
        };

        match gps_command(&self.modem, command).await {
            Ok(_) => Transition::next(next),
            Err(error) => Transition::Cleanup { step: next, error },
        }
    }
}
