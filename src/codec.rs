//! Pure parsers for the byte responses the 9602 puts on the wire.
//!
//! Each parser takes the raw slice read off the serial link (everything
//! before the `OK` terminator) and returns a typed value or
//! [`Error::Parse`]. The engine catches parse failures, reports them
//! through the sink and marks the command as failed; nothing here
//! terminates the driver.

use crate::{Error, IridiumResult, command};

/// Result line of an `AT+SBDIX` session, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub mo_status: u16,
    pub mo_msn: u16,
    pub mt_status: u16,
    pub mt_msn: u16,
    pub mt_length: u16,
    pub mt_queued: u16,
}

impl SessionStatus {
    /// MO statuses 0 through 4 indicate the outgoing transfer succeeded.
    pub fn mo_ok(&self) -> bool {
        self.mo_status <= 4
    }
}

/// A framed mobile-terminated message as returned by `AT+SBDRB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    /// Length announced by the first two frame bytes.
    pub msg_len: usize,
    pub content: Vec<u8>,
    /// Checksum bytes carried by the frame.
    pub checksum: [u8; 2],
    /// Checksum recomputed over `content`.
    pub computed: [u8; 2],
}

impl BinaryMessage {
    /// Whether the announced length and carried checksum both match the
    /// content.
    pub fn is_valid(&self) -> bool {
        self.msg_len == self.content.len() && self.checksum == self.computed
    }
}

/// First position of `needle` within `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 2-byte big-endian checksum: the unsigned sum of every content byte,
/// truncated to 16 bits.
pub fn checksum(content: &[u8]) -> [u8; 2] {
    let sum: u32 = content.iter().map(|&b| u32::from(b)).sum();
    (sum as u16).to_be_bytes()
}

/// Wraps MT content into the `len_be2 || content || checksum_be2` frame used
/// after `AT+SBDRB`.
pub fn frame_binary(content: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(content.len() + 4);
    frame.extend_from_slice(&(content.len() as u16).to_be_bytes());
    frame.extend_from_slice(content);
    frame.extend_from_slice(&checksum(content));
    frame
}

/// Cuts `data` at the first newline and trims ASCII whitespace.
fn first_line(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == b'\n') {
        Some(nl) => data[..nl].trim_ascii(),
        None => data,
    }
}

/// Locates `marker` in `data` and returns the trimmed token following it, up
/// to the next newline.
fn token_after<'a>(data: &'a [u8], marker: &[u8]) -> Option<&'a [u8]> {
    let resp = data.trim_ascii();
    let idx = find(resp, marker)?;
    Some(first_line(resp[idx + marker.len()..].trim_ascii()))
}

/// Parses the reply to `AT-MSSTM`: at least 8 hex digits of network time.
pub fn parse_system_time(data: &[u8]) -> IridiumResult<u64> {
    let err = || Error::Parse("Could not parse the system time!".to_string());
    let token = token_after(data, b"-MSSTM:").ok_or_else(err)?;
    let text = std::str::from_utf8(token).map_err(|_| err())?;
    if text.len() < 8 {
        return Err(err());
    }
    u64::from_str_radix(text, 16).map_err(|_| err())
}

/// Parses the reply to `AT+CGSN`: the first line that is neither empty nor a
/// command echo is the IMEI.
pub fn parse_serial_number(data: &[u8]) -> IridiumResult<String> {
    let err = || Error::Parse("Could not parse the serial number!".to_string());
    let resp = data
        .split(|&b| b == b'\n')
        .map(|line| line.trim_ascii())
        .find(|line| {
            !line.is_empty()
                && find(line, command::SERIAL_NUMBER).is_none()
                && find(line, b"AT+GSN").is_none()
        })
        .unwrap_or(b"");

    if resp == command::OK || data.is_empty() {
        return Err(err());
    }
    Ok(std::str::from_utf8(resp).map_err(|_| err())?.to_string())
}

/// Parses the reply to `AT+CSQ`: a bar count from 0 to 5.
pub fn parse_signal_quality(data: &[u8]) -> IridiumResult<u8> {
    let err = || Error::Parse("Could not parse the signal quality!".to_string());
    let token = token_after(data, b"+CSQ:").ok_or_else(err)?;
    std::str::from_utf8(token)
        .map_err(|_| err())?
        .parse()
        .map_err(|_| err())
}

/// Parses the reply to `AT+CRIS` into the telephony and SBD ring indicators.
pub fn parse_check_ring(data: &[u8]) -> IridiumResult<(u16, u16)> {
    let err = || Error::Parse("Could not parse the check ring response!".to_string());
    let token = token_after(data, b"+CRIS:").ok_or_else(err)?;
    let text = std::str::from_utf8(token).map_err(|_| err())?;
    let mut parts = text.split(',');
    let tri = parts.next().ok_or_else(err)?.trim().parse().map_err(|_| err())?;
    let sri = parts.next().ok_or_else(err)?.trim().parse().map_err(|_| err())?;
    Ok((tri, sri))
}

/// Parses the six comma-separated fields of an `+SBDIX:` result line.
pub fn parse_session(data: &[u8]) -> IridiumResult<SessionStatus> {
    let err = || Error::Parse("Could not parse the session!".to_string());
    let token = token_after(data, command::SESSION_RECEIVE).ok_or_else(err)?;
    let text = std::str::from_utf8(token).map_err(|_| err())?;
    let fields = text
        .split(',')
        .map(|part| part.trim().parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| err())?;
    let [mo_status, mo_msn, mt_status, mt_msn, mt_length, mt_queued] = fields[..] else {
        return Err(err());
    };
    Ok(SessionStatus {
        mo_status,
        mo_msn,
        mt_status,
        mt_msn,
        mt_length,
        mt_queued,
    })
}

/// Strips an optional `AT+SBDRB\r` echo from the front of a read-binary
/// response.
fn strip_read_binary_echo(data: &[u8]) -> &[u8] {
    match find(data, command::READ_BINARY_RECEIVE) {
        Some(idx) => &data[idx + command::READ_BINARY_RECEIVE.len()..],
        None => data,
    }
}

/// Parses a read-binary frame: two length bytes, `msg_len` content bytes and
/// two checksum bytes.
///
/// Fails unless at least `msg_len + 4` bytes are present. The caller decides
/// what to do when the carried checksum disagrees with the computed one.
pub fn parse_read_binary(data: &[u8]) -> IridiumResult<BinaryMessage> {
    let err = || Error::Parse("Could not parse the read binary response!".to_string());
    let data = strip_read_binary_echo(data);
    if data.len() < 2 {
        return Err(err());
    }
    let msg_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if data.len() < msg_len + 4 {
        return Err(err());
    }
    let content = data[2..msg_len + 2].to_vec();
    let checksum = [data[msg_len + 2], data[msg_len + 3]];
    let computed = self::checksum(&content);
    Ok(BinaryMessage {
        msg_len,
        content,
        checksum,
        computed,
    })
}

/// Whether `data` already holds a complete read-binary frame.
///
/// `OK` may legitimately appear inside binary content, so the engine uses
/// this to defer processing until the announced length is satisfied instead
/// of trusting the first terminator it sees.
pub fn has_read_binary_data(data: &[u8]) -> bool {
    let data = strip_read_binary_echo(data);
    if data.len() < 2 {
        return false;
    }
    let msg_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    data.len() >= msg_len + 4
}

/// Parses the final status of a write-binary exchange: success iff the last
/// non-whitespace byte is ASCII `0`.
pub fn parse_write_binary(data: &[u8]) -> IridiumResult<bool> {
    let resp = data.trim_ascii();
    match resp.last() {
        Some(&last) => Ok(last == b'0'),
        None => Err(Error::Parse(
            "Could not parse the write binary response!".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_from_full_response() {
        let time = parse_system_time(b"\r\n-MSSTM: 000186a0\r\n\r\nOK\r\n").unwrap();
        assert_eq!(time, 100_000);
    }

    #[test]
    fn system_time_requires_eight_hex_digits() {
        assert!(parse_system_time(b"-MSSTM: 186a0\r\n").is_err());
        assert!(parse_system_time(b"no marker here").is_err());
        assert!(parse_system_time(b"-MSSTM: zzzzzzzz\r\n").is_err());
    }

    #[test]
    fn serial_number_skips_echo_lines() {
        let sn = parse_serial_number(b"AT+CGSN\r\r\n300234063904190\r\n\r\nOK\r\n").unwrap();
        assert_eq!(sn, "300234063904190");
    }

    #[test]
    fn serial_number_without_echo() {
        let sn = parse_serial_number(b"\r\n300234063904190\r\nOK\r\n").unwrap();
        assert_eq!(sn, "300234063904190");
    }

    #[test]
    fn serial_number_rejects_bare_ok() {
        assert!(parse_serial_number(b"OK\r\n").is_err());
        assert!(parse_serial_number(b"").is_err());
    }

    #[test]
    fn signal_quality_with_echo() {
        let sig = parse_signal_quality(b"AT+CSQ\r\r\n+CSQ:3\r\n\r\nOK\r\n").unwrap();
        assert_eq!(sig, 3);
    }

    #[test]
    fn check_ring_splits_both_indicators() {
        let (tri, sri) = parse_check_ring(b"+CRIS: 0,2\r\n\r\nOK\r\n").unwrap();
        assert_eq!((tri, sri), (0, 2));
    }

    #[test]
    fn session_parses_six_fields_with_spaces() {
        let status = parse_session(b"AT+SBDIX\r\r\n+SBDIX: 1, 42, 1, 7, 5, 2\r\n\r\n").unwrap();
        assert_eq!(
            status,
            SessionStatus {
                mo_status: 1,
                mo_msn: 42,
                mt_status: 1,
                mt_msn: 7,
                mt_length: 5,
                mt_queued: 2,
            }
        );
        assert!(status.mo_ok());
    }

    #[test]
    fn session_rejects_short_field_list() {
        assert!(parse_session(b"+SBDIX: 1, 42, 1\r\n").is_err());
    }

    #[test]
    fn checksum_is_low_sixteen_bits_of_byte_sum() {
        assert_eq!(checksum(b"hello"), [0x02, 0x14]);
        assert_eq!(checksum(b""), [0x00, 0x00]);
        // 340 bytes of 0xff sums to 0x152ac, keeping only the low 16 bits.
        assert_eq!(checksum(&[0xff; 340]), [0x52, 0xac]);
    }

    #[test]
    fn read_binary_round_trip() {
        let frame = frame_binary(b"hello");
        assert_eq!(frame, b"\x00\x05hello\x02\x14");

        let msg = parse_read_binary(&frame).unwrap();
        assert_eq!(msg.msg_len, 5);
        assert_eq!(msg.content, b"hello");
        assert_eq!(msg.checksum, msg.computed);
        assert!(msg.is_valid());
    }

    #[test]
    fn read_binary_strips_command_echo() {
        let msg = parse_read_binary(b"AT+SBDRB\r\x00\x05hello\x02\x14\r\nOK\r\n").unwrap();
        assert_eq!(msg.content, b"hello");
        assert!(msg.is_valid());
    }

    #[test]
    fn read_binary_needs_length_plus_four_bytes() {
        assert!(parse_read_binary(b"\x00\x05hel").is_err());
        assert!(!has_read_binary_data(b"\x00\x05hel"));
        assert!(!has_read_binary_data(b"\x00"));
    }

    #[test]
    fn parse_success_implies_has_data() {
        let inputs: &[&[u8]] = &[
            b"\x00\x05hello\x02\x14",
            b"AT+SBDRB\r\x00\x00\x00\x00",
            b"\x00\x01a\x00\x61extra trailing bytes",
            b"\x00\x05hel",
            b"",
        ];
        for input in inputs {
            if parse_read_binary(input).is_ok() {
                assert!(has_read_binary_data(input));
            }
        }
    }

    #[test]
    fn write_binary_checks_trailing_status_byte() {
        assert!(parse_write_binary(b"\r\n0\r\n").unwrap());
        assert!(!parse_write_binary(b"\r\n18\r\n").unwrap());
        assert!(parse_write_binary(b"  \r\n").is_err());
    }
}
