//! Table-driven AT command sequences.
//!
//! A sequence is a slice of [`SequenceCommand`]s run in order on one port.
//! After each reply the command's [`ResponseProcessor`] decides whether to
//! stop with a result, stop with an error, or go on to the next entry.
//!
//! ```
//! use std::time::Duration;
//! use mmlib_modem::sequence::{self, SequenceCommand};
//!
//! // Try the vendor query first, fall back to the standard one.
//! static REVISION: &[SequenceCommand<'static>] = &[
//!     SequenceCommand::new("^SWREV", Duration::from_secs(3))
//!         .cached()
//!         .processor(sequence::string_ignore_at_errors),
//!     SequenceCommand::new("+CGMR", Duration::from_secs(3))
//!         .cached()
//!         .processor(sequence::string),
//! ];
//! assert_eq!(REVISION.len(), 2);
//! ```

use std::time::Duration;

use mmlib_core::error::{Error, Result};

/// What a response processor decided.
#[derive(Debug)]
pub enum ProcessorResult {
    /// Run the next command. At the end of the table the sequence completes
    /// without a result.
    Continue,
    /// Stop and complete with the optional result.
    Success(Option<String>),
    /// Stop and fail.
    Failure(Error),
}

/// Inspects one reply of a sequence.
///
/// `last` is true for the final entry of the table.
pub type ResponseProcessor = fn(command: &str, reply: Result<String>, last: bool) -> ProcessorResult;

/// One entry of an AT sequence.
#[derive(Debug, Clone, Copy)]
pub struct SequenceCommand<'a> {
    pub command: &'a str,
    pub timeout: Duration,
    pub allow_cached: bool,
    /// Delay before this command is sent, when it is not the first one.
    pub wait: Duration,
    /// `None` always continues.
    pub processor: Option<ResponseProcessor>,
}

impl<'a> SequenceCommand<'a> {
    pub const fn new(command: &'a str, timeout: Duration) -> Self {
        SequenceCommand {
            command,
            timeout,
            allow_cached: false,
            wait: Duration::ZERO,
            processor: None,
        }
    }

    pub const fn cached(mut self) -> Self {
        self.allow_cached = true;
        self
    }

    pub const fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub const fn processor(mut self, processor: ResponseProcessor) -> Self {
        self.processor = Some(processor);
        self
    }
}

/// Succeed with the reply text; fail on error.
pub fn string(_command: &str, reply: Result<String>, _last: bool) -> ProcessorResult {
    match reply {
        Ok(text) => ProcessorResult::Success(Some(text)),
        Err(e) => ProcessorResult::Failure(e),
    }
}

/// Succeed without a result; fail on error.
pub fn no_result(_command: &str, reply: Result<String>, _last: bool) -> ProcessorResult {
    match reply {
        Ok(_) => ProcessorResult::Success(None),
        Err(e) => ProcessorResult::Failure(e),
    }
}

/// Keep going on success; fail on error.
pub fn no_result_continue(_command: &str, reply: Result<String>, _last: bool) -> ProcessorResult {
    match reply {
        Ok(_) => ProcessorResult::Continue,
        Err(e) => ProcessorResult::Failure(e),
    }
}

/// Stop at the first command that succeeds; keep going on error.
pub fn continue_on_error(_command: &str, reply: Result<String>, _last: bool) -> ProcessorResult {
    match reply {
        Ok(_) => ProcessorResult::Success(None),
        Err(_) => ProcessorResult::Continue,
    }
}

/// Succeed with the reply text. Errors reported by the modem move on to the
/// next command unless this is the last one; any other error fails.
pub fn string_ignore_at_errors(_command: &str, reply: Result<String>, last: bool) -> ProcessorResult {
    match reply {
        Ok(text) => ProcessorResult::Success(Some(text)),
        Err(e) if !last && e.is_protocol_error() => ProcessorResult::Continue,
        Err(e) => ProcessorResult::Failure(e),
    }
}
