//! Numeric error code tables from 3GPP TS 27.007 (`+CME ERROR`) and
//! TS 27.005 (`+CMS ERROR`).
//!
//! Only the generic codes are listed. Vendor-specific codes (for example
//! 767, "operation failed" on Cinterion modules) fall back to a generic
//! description but keep their number, so callers can still match on it.

use crate::error::{Error, MOBILE_ERROR_UNKNOWN};

const MOBILE_ERRORS: &[(u32, &str)] = &[
    (0, "Phone failure"),
    (1, "No connection to phone"),
    (2, "Phone-adaptor link reserved"),
    (3, "Operation not allowed"),
    (4, "Operation not supported"),
    (5, "PH-SIM PIN required"),
    (6, "PH-FSIM PIN required"),
    (7, "PH-FSIM PUK required"),
    (10, "SIM not inserted"),
    (11, "SIM PIN required"),
    (12, "SIM PUK required"),
    (13, "SIM failure"),
    (14, "SIM busy"),
    (15, "SIM wrong"),
    (16, "Incorrect password"),
    (17, "SIM PIN2 required"),
    (18, "SIM PUK2 required"),
    (20, "Memory full"),
    (21, "Invalid index"),
    (22, "Not found"),
    (23, "Memory failure"),
    (24, "Text string too long"),
    (25, "Invalid characters in text string"),
    (26, "Dial string too long"),
    (27, "Invalid characters in dial string"),
    (30, "No network service"),
    (31, "Network timeout"),
    (32, "Network not allowed - emergency calls only"),
    (40, "Network personalization PIN required"),
    (41, "Network personalization PUK required"),
    (42, "Network subset personalization PIN required"),
    (43, "Network subset personalization PUK required"),
    (44, "Service provider personalization PIN required"),
    (45, "Service provider personalization PUK required"),
    (46, "Corporate personalization PIN required"),
    (47, "Corporate personalization PUK required"),
    (48, "Hidden key required"),
    (49, "EAP method not supported"),
    (50, "Incorrect parameters"),
    (100, "Unknown error"),
    (103, "Illegal MS/UE"),
    (106, "Illegal ME"),
    (107, "PS services not allowed"),
    (111, "PLMN not allowed"),
    (112, "Location/tracking area not allowed"),
    (113, "Roaming not allowed in this location/tracking area"),
    (132, "Service option not supported"),
    (133, "Requested service option not subscribed"),
    (134, "Service option temporarily out of order"),
    (148, "Unspecified GPRS error"),
    (149, "PDP authentication failure"),
    (150, "Invalid mobile class"),
];

const MESSAGE_ERRORS: &[(u32, &str)] = &[
    (300, "ME failure"),
    (301, "SMS service reserved"),
    (302, "Operation not allowed"),
    (303, "Operation not supported"),
    (304, "Invalid PDU mode parameter"),
    (305, "Invalid text mode parameter"),
    (310, "SIM not inserted"),
    (311, "SIM PIN required"),
    (312, "PH-SIM PIN required"),
    (313, "SIM failure"),
    (314, "SIM busy"),
    (315, "SIM wrong"),
    (316, "SIM PUK required"),
    (317, "SIM PIN2 required"),
    (318, "SIM PUK2 required"),
    (320, "Memory failure"),
    (321, "Invalid memory index"),
    (322, "Memory full"),
    (330, "SMSC address unknown"),
    (331, "No network service"),
    (332, "Network timeout"),
    (340, "No +CNMA acknowledgement expected"),
    (500, "Unknown error"),
];

fn lookup(table: &[(u32, &'static str)], code: u32) -> Option<&'static str> {
    table.iter().find(|(c, _)| *c == code).map(|(_, m)| *m)
}

/// Lowercase alphanumerics only, so "SIM PIN required" and
/// "sim-pin REQUIRED" compare equal.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl Error {
    /// Build a [`Error::Mobile`] for a numeric `+CME ERROR` code.
    pub fn mobile(code: u32) -> Self {
        let message = lookup(MOBILE_ERRORS, code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown mobile equipment error {code}"));
        Error::Mobile { code, message }
    }

    /// Build a [`Error::Message`] for a numeric `+CMS ERROR` code.
    pub fn message(code: u32) -> Self {
        let message = lookup(MESSAGE_ERRORS, code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown message service error {code}"));
        Error::Message { code, message }
    }

    /// Build a [`Error::Mobile`] from the verbose form (`AT+CMEE=2`).
    ///
    /// Unrecognized text maps to the generic "unknown" code and is kept as
    /// the message.
    pub fn mobile_from_text(text: &str) -> Self {
        let wanted = normalize(text);
        match MOBILE_ERRORS.iter().find(|(_, m)| normalize(m) == wanted) {
            Some((code, message)) => Error::Mobile {
                code: *code,
                message: (*message).to_string(),
            },
            None => Error::Mobile {
                code: MOBILE_ERROR_UNKNOWN,
                message: text.trim().to_string(),
            },
        }
    }
}
