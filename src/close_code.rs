//! The RFC 6455 §7.4 close-code taxonomy. Codes 1005, 1006 and 1015 are synthetic:
//! they describe the *absence* of a code on the wire and must never be emitted by
//! [`crate::codec::encode`].

use crate::error::ProtocolError;

/// A 16-bit WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    /// Synthetic: no status code was present in the Close frame.
    pub const NO_STATUS_RECEIVED: CloseCode = CloseCode(1005);
    /// Synthetic: the connection was dropped without a Close frame being observed.
    pub const ABNORMAL_CLOSURE: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const MANDATORY_EXTENSION: CloseCode = CloseCode(1010);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
    pub const SERVICE_RESTART: CloseCode = CloseCode(1012);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const BAD_GATEWAY: CloseCode = CloseCode(1014);
    /// Synthetic: the TLS handshake failed, so no Close frame could ever be sent.
    pub const TLS_HANDSHAKE: CloseCode = CloseCode(1015);

    /// True for codes that are never legal to put on the wire. They exist purely to
    /// let the local API describe "no code" / "abnormal" conditions.
    pub fn is_synthetic(self) -> bool {
        matches!(self.0, 1005 | 1006 | 1015)
    }

    /// True for codes an endpoint is allowed to *send*. Per RFC 6455 §7.4.2, the
    /// reserved ranges below 1000 and the unassigned 1016..=2999 range (save for the
    /// ones registered above) are rejected, as are the synthetic codes.
    pub fn is_valid_to_send(self) -> bool {
        if self.is_synthetic() {
            return false;
        }
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    pub fn validate(self) -> Result<Self, ProtocolError> {
        if self.is_valid_to_send() {
            Ok(self)
        } else {
            Err(ProtocolError::InvalidCloseCode(self.0))
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        CloseCode(value)
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_codes_never_validate_for_send() {
        assert!(CloseCode::NO_STATUS_RECEIVED.validate().is_err());
        assert!(CloseCode::ABNORMAL_CLOSURE.validate().is_err());
        assert!(CloseCode::TLS_HANDSHAKE.validate().is_err());
    }

    #[test]
    fn normal_and_application_codes_validate() {
        assert!(CloseCode::NORMAL.validate().is_ok());
        assert!(CloseCode::POLICY_VIOLATION.validate().is_ok());
        assert!(CloseCode(3000).validate().is_ok());
        assert!(CloseCode(4999).validate().is_ok());
    }

    #[test]
    fn reserved_and_unassigned_codes_reject() {
        assert!(CloseCode(999).validate().is_err());
        assert!(CloseCode(1016).validate().is_err());
        assert!(CloseCode(2999).validate().is_err());
    }
}
