//! mmlib-core: Core traits, types, and error definitions for mmlib.
//!
//! This crate defines the pieces shared by every layer of the AT protocol
//! engine: the byte-level [`Transport`] a port talks through, the
//! [`Error`] taxonomy surfaced to callers, port-level notifications, and
//! the small value types (port flags, line endings, feature support) that
//! modem objects carry around.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to one modem interface
//! - [`PortEvent`] -- asynchronous port health notifications
//! - [`Error`] / [`Result`] -- error handling
//! - [`FeatureSupport`] -- tri-state capability flag learned by probing

pub mod codes;
pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use mmlib_core::*`.
pub use error::{ConnectFailure, Error, MOBILE_ERROR_UNKNOWN, Result};
pub use events::PortEvent;
pub use transport::Transport;
pub use types::{FeatureSupport, LineEnding, PortFlags, PortKind};
