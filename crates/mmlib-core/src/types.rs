//! Port model types shared across mmlib.

use std::fmt;

bitflags::bitflags! {
    /// Role flags a modem assigns to a port when it grabs the device node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortFlags: u32 {
        /// Main control port; receives the bulk of the AT traffic.
        const PRIMARY = 1 << 0;
        /// Alternate control port, used while the primary is in data mode.
        const SECONDARY = 1 << 1;
        /// Port used for PPP data sessions.
        const PPP = 1 << 2;
        /// Port accepting GPS engine control commands.
        const GPS_CONTROL = 1 << 3;
    }
}

/// The kind of device node a port wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// AT command interface.
    At,
    /// Raw NMEA stream from a GPS engine.
    Gps,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::At => write!(f, "at"),
            PortKind::Gps => write!(f, "gps"),
        }
    }
}

/// Line terminator appended after an encoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LineEnding {
    /// Carriage return only (`\r`), the V.250 default.
    #[default]
    Cr,
    /// Carriage return followed by line feed (`\r\n`).
    CrLf,
}

impl LineEnding {
    /// Whether a line feed follows the carriage return.
    pub fn sends_lf(self) -> bool {
        matches!(self, LineEnding::CrLf)
    }
}

/// Tri-state result of probing a modem for an optional capability.
///
/// Only moves from `Unknown` to one of the two known states; returning to
/// `Unknown` takes an explicit reset of the owning cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeatureSupport {
    #[default]
    Unknown,
    Supported,
    NotSupported,
}

impl FeatureSupport {
    /// Whether the probe has run.
    pub fn is_known(self) -> bool {
        !matches!(self, FeatureSupport::Unknown)
    }
}

impl From<bool> for FeatureSupport {
    fn from(supported: bool) -> Self {
        if supported {
            FeatureSupport::Supported
        } else {
            FeatureSupport::NotSupported
        }
    }
}

impl fmt::Display for FeatureSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureSupport::Unknown => "unknown",
            FeatureSupport::Supported => "supported",
            FeatureSupport::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}
