//! The AT command catalog for the 9602.
//!
//! Commands are opaque byte strings written to the wire followed by `\r`.
//! `OK`, `SBDRING` and `READY` are response markers, never issued as
//! commands, and are deliberately absent from [`all`].

/// Terminator for request and configuration responses.
pub const OK: &[u8] = b"OK";
/// Unsolicited ring alert raised by the modem when MT traffic is waiting.
pub const RING: &[u8] = b"SBDRING";
/// Stage-one terminator of the write-binary exchange.
pub const READY: &[u8] = b"READY";

pub const PING: &[u8] = b"AT";

pub const ECHO_ON: &[u8] = b"ATE1";
pub const ECHO_OFF: &[u8] = b"ATE0";

pub const FLOW_CONTROL_ON: &[u8] = b"AT&K3";
pub const FLOW_CONTROL_OFF: &[u8] = b"AT&K0";

pub const RING_ALERTS_ON: &[u8] = b"AT+SBDMTA=1";
pub const RING_ALERTS_OFF: &[u8] = b"AT+SBDMTA=0";

pub const SYSTEM_TIME: &[u8] = b"AT-MSSTM";
pub const SERIAL_NUMBER: &[u8] = b"AT+CGSN";
pub const SIGNAL_QUALITY: &[u8] = b"AT+CSQ";
pub const CHECK_RING: &[u8] = b"AT+CRIS";

/// Common prefix of the three clear-buffer commands.
pub const CLEAR_BUFFER: &[u8] = b"AT+SBDD";
pub const CLEAR_MO_BUFFER: &[u8] = b"AT+SBDD0";
pub const CLEAR_MT_BUFFER: &[u8] = b"AT+SBDD1";
pub const CLEAR_BOTH_BUFFERS: &[u8] = b"AT+SBDD2";

pub const SESSION: &[u8] = b"AT+SBDIX";
/// Response prefix of a session result line.
pub const SESSION_RECEIVE: &[u8] = b"+SBDIX:";

pub const READ_BINARY: &[u8] = b"AT+SBDRB";
/// Echo prefix of a read-binary response frame.
pub const READ_BINARY_RECEIVE: &[u8] = b"AT+SBDRB\r";

/// Prefix only. The decimal payload length is appended at call time.
pub const WRITE_BINARY: &[u8] = b"AT+SBDWB=";

pub const REPEAT_LAST: &[u8] = b"A/";
pub const RETURN_ECHO: &[u8] = b"En";
pub const RETURN_IDENTIFICATION: &[u8] = b"In";

/// Every issuable command, excluding the `OK`/`SBDRING`/`READY` responses.
pub fn all() -> &'static [&'static [u8]] {
    &[
        PING,
        ECHO_ON,
        ECHO_OFF,
        FLOW_CONTROL_ON,
        FLOW_CONTROL_OFF,
        RING_ALERTS_ON,
        RING_ALERTS_OFF,
        SYSTEM_TIME,
        SERIAL_NUMBER,
        SIGNAL_QUALITY,
        CHECK_RING,
        CLEAR_MO_BUFFER,
        CLEAR_MT_BUFFER,
        CLEAR_BOTH_BUFFERS,
        SESSION,
        READ_BINARY,
        WRITE_BINARY,
        REPEAT_LAST,
        RETURN_ECHO,
        RETURN_IDENTIFICATION,
    ]
}

/// Returns whether `data` is a known command, with or without the trailing
/// `\r`.
pub fn is_command(data: &[u8]) -> bool {
    let data = data.strip_suffix(b"\r").unwrap_or(data);
    all().contains(&data)
}

/// User-facing description of an `+SBDIX:` mobile-originated status code.
///
/// Codes 0 through 4 indicate the MO transfer succeeded, everything above
/// is a failure.
pub fn mo_status_text(code: u16) -> &'static str {
    match code {
        0 => "MO message, if any, transferred successfully.",
        1 => {
            "MO message, if any, transferred successfully, but the MT message in the \
             queue was too big to be transferred."
        }
        2 => {
            "MO message, if any, transferred successfully, but the requested Location \
             Update was not accepted."
        }
        3 | 4 => "Reserved, but indicate MO session success if used.",
        5..=8 => "Reserved, but indicate MO session failure if used.",
        10 => "Gateway reported that the call did not complete in the allowed time.",
        11 => "MO message queue at the Gateway is full.",
        12 => "MO message has too many segments.",
        13 => "Gateway reported that the session did not complete.",
        14 => "Invalid segment size.",
        15 => "Access is denied.",
        16 => "9602 has been locked and may not make SBD calls (see +CULK command).",
        17 => "Gateway not responding (local session timeout).",
        18 => "Connection lost (RF drop).",
        32 => "No network service, unable to initiate call.",
        33 => "Antenna fault, unable to initiate call.",
        34 => "Radio is disabled, unable to initiate call (see *Rn command).",
        35 => "9602 is busy, unable to initiate call (typically performing auto-registration).",
        _ => "Unknown failure!",
    }
}

/// User-facing description of an `+SBDIX:` mobile-terminated status code.
pub fn mt_status_text(code: u16) -> &'static str {
    match code {
        0 => "No MT SBD message to receive from the Gateway.",
        1 => "MT SBD message successfully received from the Gateway.",
        2 => {
            "An error occurred while attempting to perform a mailbox check or receive \
             a message from the Gateway."
        }
        _ => "Unknown error!",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_match_with_and_without_terminator() {
        assert!(is_command(b"AT"));
        assert!(is_command(b"AT\r"));
        assert!(is_command(b"AT+SBDIX"));
        assert!(is_command(b"AT+SBDIX\r"));
        assert!(is_command(b"A/"));
    }

    #[test]
    fn responses_are_not_commands() {
        assert!(!is_command(OK));
        assert!(!is_command(RING));
        assert!(!is_command(READY));
        assert!(!is_command(b"OK\r"));
    }

    #[test]
    fn garbage_is_not_a_command() {
        assert!(!is_command(b""));
        assert!(!is_command(b"ATZ"));
        assert!(!is_command(b"AT+SBDWB=12"));
    }

    #[test]
    fn mo_status_splits_success_from_failure() {
        for code in 0..=4 {
            assert!(!mo_status_text(code).contains("failure"), "code {code}");
        }
        assert_eq!(mo_status_text(18), "Connection lost (RF drop).");
        assert_eq!(mo_status_text(200), "Unknown failure!");
    }
}
