//! Modem-level building blocks on top of the mmlib AT engine.
//!
//! - **Modem object** ([`modem`]) -- [`BaseModem`] owns the AT ports grabbed
//!   for one device, a modem-wide cancellation token and the
//!   [`FeatureCache`], and runs single commands on the best port.
//! - **AT sequences** ([`sequence`]) -- table-driven command lists with
//!   response processors deciding whether to keep going.
//! - **Step sequencer** ([`steps`]) -- explicit step state machines with
//!   retries, settling delays and saved-error cleanup.
//! - **Feature cache** ([`feature`]) -- tri-state support flags probed at
//!   most once per modem.
//! - **Consumers** ([`location`], [`power`]) -- GPS engine control and
//!   power-down built from the pieces above.

pub mod feature;
pub mod location;
pub mod modem;
pub mod power;
pub mod sequence;
pub mod steps;

pub use feature::FeatureCache;
pub use location::{EngineGpsLocation, GenericLocation, LocationGathering, LocationSources};
pub use modem::{BaseModem, BaseModemBuilder};
pub use power::PowerDown;
pub use sequence::{ProcessorResult, ResponseProcessor, SequenceCommand};
pub use steps::{SequenceContext, StepMachine, Transition, run_steps};
