use crate::error::{Error, ProtocolError};
use std::fmt;

/// A WebSocket close status code.
///
/// The registered range is 1000-1015, and 3000-4999 is reserved for private
/// use. The codes 1004, 1005, 1006 and 1015 are meaningful to endpoints but
/// must never appear inside a Close frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    /// Reserved, never sent. Stands for "no status code was present".
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Reserved, never sent. Stands for an abnormally dropped transport.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const MANDATORY_EXTENSION: CloseCode = CloseCode(1010);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const SERVICE_RESTART: CloseCode = CloseCode(1012);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const BAD_GATEWAY: CloseCode = CloseCode(1014);

    pub const fn new(code: u16) -> CloseCode {
        CloseCode(code)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this code may be written inside a Close frame we emit.
    /// 1000-2999 minus the reserved codes, plus the private 3000-4999 range.
    pub fn is_sendable(self) -> bool {
        match self.0 {
            1004 | 1005 | 1006 | 1015 => false,
            1000..=2999 | 3000..=4999 => true,
            _ => false,
        }
    }

    /// Whether this code is acceptable inside a received Close frame.
    pub fn is_valid_received(self) -> bool {
        match self.0 {
            1004 | 1005 | 1006 | 1015 => false,
            1000..=1015 | 3000..=4999 => true,
            _ => false,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        CloseCode(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The payload of a Close frame: a status code followed by an optional UTF-8
/// reason of at most 123 bytes. This doubles as the terminal error carried by
/// [`Error::ConnectionClosed`](crate::error::Error::ConnectionClosed) once the
/// peer has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

/// Everything past the 2-byte status code, capped so that code plus reason
/// fits a control frame.
pub const MAX_CLOSE_REASON: usize = 123;

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> CloseFrame {
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }

    /// Parses a received Close frame payload. An empty payload is valid and
    /// stands for "no status"; a one-byte payload is not.
    pub(crate) fn parse(payload: &[u8]) -> Result<CloseFrame, Error> {
        if payload.is_empty() {
            return Ok(CloseFrame {
                code: CloseCode::NO_STATUS,
                reason: String::new(),
            });
        }
        if payload.len() == 1 {
            return Err(ProtocolError::InvalidClosePayload.into());
        }

        let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
        if !code.is_valid_received() {
            return Err(ProtocolError::InvalidCloseCode(code.0).into());
        }

        let reason = std::str::from_utf8(&payload[2..])
            .map_err(|_| Error::from(ProtocolError::InvalidClosePayload))?;

        Ok(CloseFrame {
            code,
            reason: reason.to_owned(),
        })
    }

    /// Encodes this close frame for the wire. A code that must not be sent is
    /// replaced with 1011 rather than producing a malformed frame, and a
    /// missing status encodes to an empty payload.
    pub(crate) fn encode(&self) -> Vec<u8> {
        if self.code == CloseCode::NO_STATUS {
            return Vec::new();
        }

        let code = if self.code.is_sendable() {
            self.code
        } else {
            CloseCode::INTERNAL_ERROR
        };

        debug_assert!(self.reason.len() <= MAX_CLOSE_REASON);
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&code.0.to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "status {}", self.code)
        } else {
            write!(f, "status {} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendable_and_received_ranges() {
        assert!(CloseCode::NORMAL.is_sendable());
        assert!(CloseCode::new(2999).is_sendable());
        assert!(CloseCode::new(3000).is_sendable());
        assert!(CloseCode::new(4999).is_sendable());
        assert!(!CloseCode::new(5000).is_sendable());
        assert!(!CloseCode::new(999).is_sendable());
        for reserved in [1004, 1005, 1006, 1015] {
            assert!(!CloseCode::new(reserved).is_sendable());
            assert!(!CloseCode::new(reserved).is_valid_received());
        }
        assert!(CloseCode::new(1012).is_valid_received());
        assert!(!CloseCode::new(1016).is_valid_received());
        assert!(!CloseCode::new(2999).is_valid_received());
        assert!(CloseCode::new(4000).is_valid_received());
    }

    #[test]
    fn parse_round_trip() {
        let frame = CloseFrame::new(CloseCode::NORMAL, "bye");
        let parsed = CloseFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn empty_payload_means_no_status() {
        let parsed = CloseFrame::parse(&[]).unwrap();
        assert_eq!(parsed.code, CloseCode::NO_STATUS);
        assert!(parsed.reason.is_empty());
        // And it encodes back to nothing, 1005 never hits the wire.
        assert!(parsed.encode().is_empty());
    }

    #[test]
    fn one_byte_payload_is_invalid() {
        assert!(CloseFrame::parse(&[0x03]).is_err());
    }

    #[test]
    fn invalid_reason_utf8_is_rejected() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xff, 0xfe]);
        assert!(CloseFrame::parse(&payload).is_err());
    }

    #[test]
    fn unsendable_code_downgrades_to_internal_error() {
        let encoded = CloseFrame::new(CloseCode::new(1006), "oops").encode();
        let parsed = CloseFrame::parse(&encoded).unwrap();
        assert_eq!(parsed.code, CloseCode::INTERNAL_ERROR);
        assert_eq!(parsed.reason, "oops");
    }
}
