//! Byte-level framing helpers for AT ports.
//!
//! Modems answer on CRLF-delimited lines. Anything that arrives before the
//! first CRLF of a reply is the modem echoing the command back (or line
//! noise from a previous exchange) and is dropped before parsing.

use std::fmt::Write;

/// The line terminator every modem response is framed with.
pub const CRLF: &[u8] = b"\r\n";

/// Strip leading echo from `buf`, in place.
///
/// Everything before the first CRLF is removed. Buffers of two bytes or
/// fewer, buffers that already start with CRLF, and buffers without any
/// CRLF are left untouched: the echo may still be arriving.
pub fn remove_echo(buf: &mut Vec<u8>) {
    if buf.len() <= 2 {
        return;
    }
    if let Some(pos) = find_crlf(buf) {
        if pos > 0 {
            buf.drain(..pos);
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Turn a command string into the bytes written to the port.
///
/// Non-raw commands get an `AT` prefix unless they already start with one,
/// and a trailing `\r` unless one of the last two characters already is a
/// carriage return. With `send_lf` a `\n` is added the same way. Raw
/// commands are written byte for byte.
pub fn encode_command(command: &str, is_raw: bool, send_lf: bool) -> Vec<u8> {
    let cmd = command.as_bytes();
    let mut out = Vec::with_capacity(cmd.len() + 4);

    if is_raw {
        out.extend_from_slice(cmd);
        return out;
    }

    if !cmd.starts_with(b"AT") {
        out.extend_from_slice(b"AT");
    }
    out.extend_from_slice(cmd);

    if !ends_near(cmd, b'\r') {
        out.push(b'\r');
    }
    if send_lf && !ends_near(cmd, b'\n') {
        out.push(b'\n');
    }
    out
}

/// Whether `byte` is one of the last two bytes of `cmd`.
fn ends_near(cmd: &[u8], byte: u8) -> bool {
    cmd.iter().rev().take(2).any(|b| *b == byte)
}

/// Quote `s` as an AT string parameter.
///
/// The result is wrapped in double quotes. Control characters, `"` and `\`
/// are written as a backslash followed by two uppercase hex digits.
///
/// ```
/// use mmlib_at_io::framer::quote_string;
///
/// assert_eq!(quote_string("internet"), "\"internet\"");
/// assert_eq!(quote_string("a\"b"), "\"a\\22b\"");
/// ```
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if (c as u32) < 0x20 || c == '"' || c == '\\' {
            let _ = write!(out, "\\{:02X}", c as u32);
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

/// Render raw port bytes for log output.
///
/// CR and LF become `<CR>` and `<LF>`, other non-printable bytes are shown
/// as a backslash and three octal digits.
pub fn debug_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\r' => out.push_str("<CR>"),
            b'\n' => out.push_str("<LF>"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out
}
