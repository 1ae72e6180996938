//! Unsolicited result code (URC) extraction.
//!
//! Modems interleave asynchronous notifications (`+CREG:`, `+CIEV:`,
//! `RING`, vendor `^SYSSTART`, ...) with command replies. Every time bytes
//! arrive, the port runs the buffer through an [`UnsolicitedRegistry`]
//! before looking for a final response: each enabled handler's regex is
//! matched, the matched spans are cut out of the buffer, and the handler
//! callbacks run. Whatever is left is command reply text.
//!
//! Handlers are keyed by their pattern string. Registering the same
//! pattern again replaces the callback and re-enables it; a handler added
//! later is tried before older ones, so a vendor layer can claim a URC that
//! a generic layer also watches for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::bytes::Regex;
use tracing::{debug, warn};

use mmlib_core::error::{Error, Result};

use crate::framer::debug_escape;

/// Callback invoked for each match of an unsolicited handler.
///
/// Errors are logged and otherwise ignored; they never stop dispatch.
pub type UnsolicitedCallback = Arc<dyn Fn(&UnsolicitedMatch) -> Result<()> + Send + Sync>;

/// One match of an unsolicited handler, detached from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsolicitedMatch {
    pattern: String,
    text: String,
    groups: Vec<Option<String>>,
    named: HashMap<String, String>,
}

impl UnsolicitedMatch {
    /// The pattern string of the handler that matched.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The full matched text, line terminators included.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Capture group `index` (1-based; 0 is the whole match).
    pub fn group(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return Some(&self.text);
        }
        self.groups.get(index - 1)?.as_deref()
    }

    /// Named capture group.
    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// Capture group `index` parsed as an unsigned integer.
    pub fn group_u32(&self, index: usize) -> Option<u32> {
        self.group(index)?.trim().parse().ok()
    }
}

#[derive(Clone)]
struct Handler {
    pattern: String,
    regex: Regex,
    callback: Option<UnsolicitedCallback>,
    enabled: bool,
}

/// Per-port set of unsolicited message handlers.
///
/// Cheap to clone; clones share the same handler list. The list is
/// protected by a mutex that is only held while handlers are added,
/// toggled or snapshotted, never while a callback runs, so callbacks may
/// register or remove handlers themselves.
#[derive(Clone, Default)]
pub struct UnsolicitedRegistry {
    handlers: Arc<Mutex<Vec<Handler>>>,
}

impl std::fmt::Debug for UnsolicitedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<String> = self.lock().iter().map(|h| h.pattern.clone()).collect();
        f.debug_struct("UnsolicitedRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

/// A match waiting for its callback, tagged with where it sat in the
/// buffer before any span was removed.
struct Hit {
    offset: usize,
    callback: UnsolicitedCallback,
    found: UnsolicitedMatch,
}

impl UnsolicitedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` for `pattern`, or replace the callback of an
    /// existing handler with the same pattern string.
    ///
    /// A `None` callback still removes matching text from the buffer, which
    /// is how noise URCs are silenced. The handler is enabled either way.
    pub fn add(&self, pattern: &str, callback: Option<UnsolicitedCallback>) -> Result<()> {
        let mut handlers = self.lock();
        if let Some(existing) = handlers.iter_mut().find(|h| h.pattern == pattern) {
            existing.callback = callback;
            existing.enabled = true;
            return Ok(());
        }

        let regex = Regex::new(pattern).map_err(|e| {
            Error::InvalidParameter(format!("bad unsolicited pattern {pattern:?}: {e}"))
        })?;
        handlers.insert(
            0,
            Handler {
                pattern: pattern.to_string(),
                regex,
                callback,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Enable or disable the handler for `pattern`. Unknown patterns are
    /// ignored.
    pub fn enable(&self, pattern: &str, enabled: bool) {
        if let Some(handler) = self.lock().iter_mut().find(|h| h.pattern == pattern) {
            handler.enabled = enabled;
        }
    }

    /// Drop the handler for `pattern`. Returns whether one existed.
    pub fn remove(&self, pattern: &str) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|h| h.pattern != pattern);
        handlers.len() != before
    }

    /// Whether a handler for `pattern` is registered and enabled.
    pub fn is_enabled(&self, pattern: &str) -> bool {
        self.lock()
            .iter()
            .any(|h| h.pattern == pattern && h.enabled)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Extract every unsolicited message from `buf` and run the callbacks.
    ///
    /// Handlers run newest first. Each one sees the buffer as left by the
    /// handlers before it, so a span is never matched twice. Callbacks fire
    /// once all handlers have matched, in the order the matches appeared on
    /// the wire. Returns the number of matches removed.
    pub fn dispatch(&self, buf: &mut Vec<u8>) -> usize {
        let handlers: Vec<Handler> = self.lock().iter().filter(|h| h.enabled).cloned().collect();
        if handlers.is_empty() || buf.is_empty() {
            return 0;
        }

        // origin[i] is the offset byte i of `buf` had on arrival.
        let mut origin: Vec<usize> = (0..buf.len()).collect();
        let mut hits = Vec::new();
        let mut removed = 0;

        for handler in &handlers {
            let mut spans = Vec::new();
            for caps in handler.regex.captures_iter(buf) {
                let Some(whole) = caps.get(0) else { continue };
                if whole.start() == whole.end() {
                    continue;
                }
                spans.push((whole.start(), whole.end()));

                let Some(callback) = handler.callback.clone() else {
                    continue;
                };
                let groups = (1..caps.len())
                    .map(|i| caps.get(i).map(|m| lossy(m.as_bytes())))
                    .collect();
                let named = handler
                    .regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| Some((name.to_string(), lossy(caps.name(name)?.as_bytes()))))
                    .collect();
                hits.push(Hit {
                    offset: origin[whole.start()],
                    callback,
                    found: UnsolicitedMatch {
                        pattern: handler.pattern.clone(),
                        text: lossy(whole.as_bytes()),
                        groups,
                        named,
                    },
                });
            }

            // Cut back to front so earlier offsets stay valid.
            for &(start, end) in spans.iter().rev() {
                debug!(
                    pattern = %handler.pattern,
                    text = %debug_escape(&buf[start..end]),
                    "unsolicited message"
                );
                buf.drain(start..end);
                origin.drain(start..end);
            }
            removed += spans.len();
        }

        hits.sort_by_key(|hit| hit.offset);
        for hit in hits {
            if let Err(e) = (hit.callback)(&hit.found) {
                warn!(pattern = %hit.found.pattern, error = %e, "unsolicited handler failed");
            }
        }
        removed
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
