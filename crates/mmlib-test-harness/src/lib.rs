//! mmlib-test-harness: Test utilities for mmlib.
//!
//! This crate provides [`MockTransport`], a scripted stand-in for a modem
//! serial port. It answers expected commands with canned replies (optionally
//! after a delay), stays silent when told to, and lets tests inject
//! unsolicited bytes or a hangup at any time through a [`MockHandle`].

pub mod mock_serial;

pub use mock_serial::{MockHandle, MockTransport};
