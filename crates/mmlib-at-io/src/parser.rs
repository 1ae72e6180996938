//! Final response recognition.
//!
//! A [`ResponseParser`] looks at the receive buffer (after echo removal and
//! unsolicited message extraction) and decides whether the command in
//! flight has been answered. The default [`V1Parser`] understands the
//! V.250 verbose result codes plus the 3GPP `+CME ERROR` / `+CMS ERROR`
//! extensions. Vendors with non-standard final responses install their own
//! parser on the port with
//! [`AtPort::set_response_parser`](crate::port::AtPort::set_response_parser).

use std::sync::LazyLock;

use regex::bytes::{Captures, Regex};

use mmlib_core::error::{ConnectFailure, Error, MOBILE_ERROR_UNKNOWN, Result};

use crate::framer::debug_escape;

/// Outcome of one parse attempt over the receive buffer.
#[derive(Debug)]
pub enum ParseResult {
    /// No final response yet; keep the bytes and wait for more.
    Incomplete,

    /// The command succeeded.
    Final {
        /// Response text with the final result code stripped and the
        /// surrounding CR/LF trimmed.
        payload: String,
        /// Bytes to remove from the front of the buffer.
        consumed: usize,
    },

    /// The modem reported a failure.
    Error {
        error: Error,
        /// Bytes to remove from the front of the buffer.
        consumed: usize,
    },
}

/// Recognizes final responses in a port's receive buffer.
///
/// Implementations must be pure: the caller owns the buffer and drains
/// `consumed` bytes itself, leaving any trailing residue for the next
/// cycle.
pub trait ResponseParser: Send + Sync + 'static {
    fn parse(&self, buf: &[u8]) -> ParseResult;
}

impl<F> ResponseParser for F
where
    F: Fn(&[u8]) -> ParseResult + Send + Sync + 'static,
{
    fn parse(&self, buf: &[u8]) -> ParseResult {
        self(buf)
    }
}

static FINAL_RESPONSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)\r\n(?:(?P<ok>OK)|(?P<connect>CONNECT[ \t]*\d*)|\+CME ERROR:[ \t]*(?P<cme>[^\r\n]*)|\+CMS ERROR:[ \t]*(?P<cms>[^\r\n]*)|(?P<error>ERROR|COMMAND NOT SUPPORT)|(?P<failed>NO CARRIER|BUSY|NO ANSWER|NO DIALTONE))\r\n",
    )
    .expect("final response regex is valid")
});

/// The default V.250 verbose-mode (`ATV1`) parser.
///
/// Final result codes are recognized only on a line of their own; when
/// several are present the earliest one answers the command and the rest
/// stay in the buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct V1Parser;

impl V1Parser {
    pub fn new() -> Self {
        V1Parser
    }
}

impl ResponseParser for V1Parser {
    fn parse(&self, buf: &[u8]) -> ParseResult {
        let Some(caps) = FINAL_RESPONSE.captures(buf) else {
            return ParseResult::Incomplete;
        };
        let Some(whole) = caps.get(0) else {
            return ParseResult::Incomplete;
        };
        let consumed = whole.end();

        if caps.name("ok").is_some() {
            return ParseResult::Final {
                payload: clean(&buf[..whole.start()]),
                consumed,
            };
        }
        if let Some(connect) = caps.name("connect") {
            return ParseResult::Final {
                payload: clean(&buf[..connect.end()]),
                consumed,
            };
        }

        ParseResult::Error {
            error: classify_error(&caps),
            consumed,
        }
    }
}

fn classify_error(caps: &Captures<'_>) -> Error {
    if let Some(cme) = caps.name("cme") {
        let text = match error_text("+CME ERROR", cme.as_bytes()) {
            Ok(text) => text,
            Err(e) => return e,
        };
        return match text.parse::<u32>() {
            Ok(code) => Error::mobile(code),
            Err(_) => Error::mobile_from_text(text),
        };
    }
    if let Some(cms) = caps.name("cms") {
        let text = match error_text("+CMS ERROR", cms.as_bytes()) {
            Ok(text) => text,
            Err(e) => return e,
        };
        return match text.parse::<u32>() {
            Ok(code) => Error::message(code),
            Err(_) => Error::Message {
                code: 500,
                message: text.to_string(),
            },
        };
    }
    if let Some(failed) = caps.name("failed") {
        let failure = match failed.as_bytes() {
            b"BUSY" => ConnectFailure::Busy,
            b"NO ANSWER" => ConnectFailure::NoAnswer,
            b"NO DIALTONE" => ConnectFailure::NoDialtone,
            _ => ConnectFailure::NoCarrier,
        };
        return Error::Connect(failure);
    }
    Error::mobile(MOBILE_ERROR_UNKNOWN)
}

/// The body of an extended error line. An empty or non-text body is a
/// malformed reply rather than an unknown error.
fn error_text<'a>(kind: &str, body: &'a [u8]) -> Result<&'a str> {
    match std::str::from_utf8(body).map(str::trim) {
        Ok(text) if !text.is_empty() && !text.contains(char::is_control) => Ok(text),
        _ => Err(Error::MalformedResponse(format!(
            "{kind} without a readable code: {}",
            debug_escape(body)
        ))),
    }
}

/// Response text with leading and trailing CR/LF removed.
fn clean(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_matches(|c| c == '\r' || c == '\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(buf: &[u8]) -> ParseResult {
        V1Parser::new().parse(buf)
    }

    fn expect_final(buf: &[u8]) -> (String, usize) {
        match parse(buf) {
            ParseResult::Final { payload, consumed } => (payload, consumed),
            other => panic!("expected Final, got {other:?}"),
        }
    }

    fn expect_error(buf: &[u8]) -> (Error, usize) {
        match parse(buf) {
            ParseResult::Error { error, consumed } => (error, consumed),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn bare_ok_has_empty_payload() {
        let (payload, consumed) = expect_final(b"\r\nOK\r\n");
        assert_eq!(payload, "");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn ok_with_information_text() {
        let buf = b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n";
        let (payload, consumed) = expect_final(buf);
        assert_eq!(payload, "+CSQ: 20,99");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn multi_line_payload_keeps_inner_line_breaks() {
        let (payload, _) = expect_final(b"\r\nQuectel\r\nEG25\r\n\r\nOK\r\n");
        assert_eq!(payload, "Quectel\r\nEG25");
    }

    #[test]
    fn incomplete_without_final() {
        assert!(matches!(parse(b"\r\n+CSQ: 20,99\r\n"), ParseResult::Incomplete));
        assert!(matches!(parse(b"\r\nOK"), ParseResult::Incomplete));
        assert!(matches!(parse(b""), ParseResult::Incomplete));
    }

    #[test]
    fn ok_inside_text_is_not_final() {
        assert!(matches!(parse(b"\r\n+COPS: \"OK Mobile\"\r\n"), ParseResult::Incomplete));
    }

    #[test]
    fn residue_after_final_is_not_consumed() {
        let buf = b"\r\nOK\r\n\r\n+CREG: 1\r\n";
        let (_, consumed) = expect_final(buf);
        assert_eq!(&buf[consumed..], b"\r\n+CREG: 1\r\n");
    }

    #[test]
    fn connect_payload_includes_connect_line() {
        let (payload, _) = expect_final(b"\r\nCONNECT 150000000\r\n");
        assert_eq!(payload, "CONNECT 150000000");
        let (payload, _) = expect_final(b"\r\nCONNECT\r\n");
        assert_eq!(payload, "CONNECT");
    }

    #[test]
    fn numeric_cme_error() {
        let (error, consumed) = expect_error(b"\r\n+CME ERROR: 10\r\n");
        assert!(error.is_protocol_code(10));
        assert!(matches!(error, Error::Mobile { .. }));
        assert_eq!(consumed, 18);
    }

    #[test]
    fn verbose_cme_error_maps_to_code() {
        let (error, _) = expect_error(b"\r\n+CME ERROR: SIM not inserted\r\n");
        assert!(error.is_protocol_code(10));
    }

    #[test]
    fn unknown_verbose_cme_error_is_code_100() {
        let (error, _) = expect_error(b"\r\n+CME ERROR: wibble\r\n");
        match error {
            Error::Mobile { code, message } => {
                assert_eq!(code, 100);
                assert_eq!(message, "wibble");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_cme_error_is_malformed() {
        let buf = b"\r\n+CME ERROR: \r\n\r\nOK\r\n";
        let (error, consumed) = expect_error(buf);
        assert!(matches!(error, Error::MalformedResponse(_)));
        assert_eq!(&buf[consumed..], b"\r\nOK\r\n");
    }

    #[test]
    fn garbled_error_bodies_are_malformed() {
        let (error, _) = expect_error(b"\r\n+CME ERROR: \xff\xfe\r\n");
        assert!(matches!(error, Error::MalformedResponse(_)));
        let (error, _) = expect_error(b"\r\n+CMS ERROR:\x00\x01\r\n");
        assert!(matches!(error, Error::MalformedResponse(_)));
    }

    #[test]
    fn cms_error() {
        let (error, _) = expect_error(b"\r\n+CMS ERROR: 330\r\n");
        assert!(matches!(error, Error::Message { code: 330, .. }));
    }

    #[test]
    fn plain_error_is_unknown_mobile_error() {
        let (error, _) = expect_error(b"\r\nERROR\r\n");
        assert!(error.is_protocol_code(100));
        let (error, _) = expect_error(b"\r\nCOMMAND NOT SUPPORT\r\n");
        assert!(error.is_protocol_code(100));
    }

    #[test]
    fn connect_failures() {
        let cases: [(&[u8], ConnectFailure); 4] = [
            (b"\r\nNO CARRIER\r\n", ConnectFailure::NoCarrier),
            (b"\r\nBUSY\r\n", ConnectFailure::Busy),
            (b"\r\nNO ANSWER\r\n", ConnectFailure::NoAnswer),
            (b"\r\nNO DIALTONE\r\n", ConnectFailure::NoDialtone),
        ];
        for (buf, want) in cases {
            let (error, _) = expect_error(buf);
            assert!(matches!(error, Error::Connect(f) if f == want), "{buf:?}");
        }
    }

    #[test]
    fn earliest_final_wins() {
        let buf = b"\r\nERROR\r\n\r\nOK\r\n";
        let (_, consumed) = expect_error(buf);
        assert_eq!(&buf[consumed..], b"\r\nOK\r\n");
    }

    #[test]
    fn closures_are_parsers() {
        let parser = |buf: &[u8]| {
            if buf.ends_with(b"> ") {
                ParseResult::Final {
                    payload: String::new(),
                    consumed: buf.len(),
                }
            } else {
                ParseResult::Incomplete
            }
        };
        assert!(matches!(parser.parse(b"\r\n> "), ParseResult::Final { .. }));
    }
}
