//! Close codes and close status per [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close frame payload is an optional 2-byte big-endian status code followed
//! by an optional UTF-8 reason of at most 123 bytes. [`CloseStatus`] is the
//! parsed, validated form of that payload; it is also created synthetically
//! (code 1006) when a connection terminates without a close handshake.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

/// Longest close reason allowed on the wire: 125 control-payload bytes minus
/// the 2-byte status code.
pub const MAX_REASON_SIZE: usize = 123;

/// Status code carried by a close frame.
///
/// The registered codes (1000-1015) get named variants; 3000-3999 are
/// IANA-registered application codes and 4000-4999 are private-use codes.
/// Codes below 1000, the reserved gaps, and 1004/1005/1006/1015 are never
/// valid on the wire in a close frame a peer sends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose for the connection is fulfilled.
    Normal,
    /// 1001: endpoint going away (server shutdown, page navigated off).
    Away,
    /// 1002: protocol error detected.
    Protocol,
    /// 1003: received a data type it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: abnormal closure, no close frame exchanged. Never sent on the wire.
    Abnormal,
    /// 1007: payload inconsistent with the message type (e.g. bad UTF-8).
    Invalid,
    /// 1008: message violates the endpoint's policy.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected an extension the server didn't negotiate.
    Extension,
    /// 1011: server encountered an unexpected condition.
    Error,
    /// 1012: service is restarting.
    Restart,
    /// 1013: try again later (e.g. overload).
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014, 1016-2999: reserved, invalid in a close frame.
    Reserved(u16),
    /// 3000-3999: registered application codes.
    Iana(u16),
    /// 4000-4999: private-use codes.
    Library(u16),
    /// Anything outside 1000-4999.
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may legally appear in a close frame on the wire.
    ///
    /// 1005, 1006 and 1015 exist only as synthetic local statuses; the
    /// reserved ranges and codes below 1000 are protocol violations.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// The resolution of a close handshake: a status code plus a human-readable
/// reason. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    code: CloseCode,
    reason: String,
}

impl CloseStatus {
    /// Creates a close status, rejecting reasons longer than
    /// [`MAX_REASON_SIZE`] bytes.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Result<Self> {
        let reason = reason.into();
        if reason.len() > MAX_REASON_SIZE {
            return Err(WebSocketError::InvalidCloseFrame);
        }
        Ok(Self { code, reason })
    }

    /// Creates a close status, truncating the reason on a character boundary
    /// to fit the wire limit. Used for engine-generated statuses whose reason
    /// text comes from an error message.
    pub fn truncated(code: CloseCode, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_SIZE);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            code,
            reason: reason[..end].to_owned(),
        }
    }

    /// Normal closure (1000) with no reason.
    pub fn normal() -> Self {
        Self {
            code: CloseCode::Normal,
            reason: String::new(),
        }
    }

    /// Synthetic status for a close frame that carried no code (1005).
    pub fn no_status() -> Self {
        Self {
            code: CloseCode::Status,
            reason: String::new(),
        }
    }

    /// Synthetic status for a connection torn down without a close handshake
    /// (1006).
    pub fn abnormal(reason: &str) -> Self {
        Self::truncated(CloseCode::Abnormal, reason)
    }

    pub fn code(&self) -> CloseCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether this status is the synthetic abnormal closure (1006).
    pub fn is_abnormal(&self) -> bool {
        self.code == CloseCode::Abnormal
    }

    /// Parses and validates a received close frame payload.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseFrame`]: payload is exactly one byte
    /// - [`WebSocketError::InvalidCloseCode`]: the code is not legal on the wire
    /// - [`WebSocketError::InvalidUTF8`]: the reason is not valid UTF-8
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self::no_status()),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let raw = u16::from_be_bytes([payload[0], payload[1]]);
                let code = CloseCode::from(raw);
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(raw));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUTF8)?;
                Self::new(code, reason)
            }
        }
    }

    /// Serializes this status into a close frame payload. A no-status (1005)
    /// resolution produces an empty payload.
    pub fn to_payload(&self) -> Bytes {
        if self.code == CloseCode::Status {
            return Bytes::new();
        }
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(u16::from(self.code));
        payload.extend_from_slice(self.reason.as_bytes());
        payload.freeze()
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod close_code_tests {
        use super::*;

        #[test]
        fn test_registered_codes_roundtrip() {
            for raw in [
                1000u16, 1001, 1002, 1003, 1005, 1006, 1007, 1008, 1009, 1010, 1011, 1012, 1013,
                1015, 3000, 3999, 4000, 4999,
            ] {
                assert_eq!(u16::from(CloseCode::from(raw)), raw);
            }
        }

        #[test]
        fn test_is_allowed() {
            assert!(CloseCode::Normal.is_allowed());
            assert!(CloseCode::Protocol.is_allowed());
            assert!(CloseCode::Iana(3000).is_allowed());
            assert!(CloseCode::Library(4040).is_allowed());

            assert!(!CloseCode::Status.is_allowed());
            assert!(!CloseCode::Abnormal.is_allowed());
            assert!(!CloseCode::Tls.is_allowed());
            assert!(!CloseCode::from(1004).is_allowed());
            assert!(!CloseCode::from(1014).is_allowed());
            assert!(!CloseCode::from(2999).is_allowed());
            assert!(!CloseCode::from(999).is_allowed());
            assert!(!CloseCode::from(5000).is_allowed());
        }
    }

    mod close_status_tests {
        use super::*;

        #[test]
        fn test_empty_payload_is_no_status() {
            let status = CloseStatus::from_payload(&[]).unwrap();
            assert_eq!(status.code(), CloseCode::Status);
            assert_eq!(status.reason(), "");
            assert!(status.to_payload().is_empty());
        }

        #[test]
        fn test_one_byte_payload_rejected() {
            assert!(matches!(
                CloseStatus::from_payload(&[0x03]),
                Err(WebSocketError::InvalidCloseFrame)
            ));
        }

        #[test]
        fn test_code_and_reason_roundtrip() {
            let status = CloseStatus::new(CloseCode::Away, "maintenance").unwrap();
            let parsed = CloseStatus::from_payload(&status.to_payload()).unwrap();
            assert_eq!(parsed, status);
        }

        #[test]
        fn test_disallowed_code_rejected() {
            let mut payload = 1006u16.to_be_bytes().to_vec();
            payload.extend_from_slice(b"nope");
            assert!(matches!(
                CloseStatus::from_payload(&payload),
                Err(WebSocketError::InvalidCloseCode(1006))
            ));
        }

        #[test]
        fn test_invalid_utf8_reason_rejected() {
            let mut payload = 1000u16.to_be_bytes().to_vec();
            payload.extend_from_slice(&[0xFF, 0xFE]);
            assert!(matches!(
                CloseStatus::from_payload(&payload),
                Err(WebSocketError::InvalidUTF8)
            ));
        }

        #[test]
        fn test_reason_length_limit() {
            let long = "x".repeat(MAX_REASON_SIZE + 1);
            assert!(CloseStatus::new(CloseCode::Normal, long.clone()).is_err());

            let status = CloseStatus::truncated(CloseCode::Normal, &long);
            assert_eq!(status.reason().len(), MAX_REASON_SIZE);
        }

        #[test]
        fn test_truncated_respects_char_boundaries() {
            // 4-byte scalar values straddle the 123-byte cut.
            let reason = "𝄞".repeat(40);
            let status = CloseStatus::truncated(CloseCode::Normal, &reason);
            assert!(status.reason().len() <= MAX_REASON_SIZE);
            assert!(status.reason().chars().all(|c| c == '𝄞'));
        }

        #[test]
        fn test_abnormal_synthetic_status() {
            let status = CloseStatus::abnormal("connection reset");
            assert!(status.is_abnormal());
            assert_eq!(u16::from(status.code()), 1006);
        }
    }
}
