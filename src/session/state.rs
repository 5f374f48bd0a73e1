//! Session state bits.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// A bitmask of orthogonal facts about a [`Session`][`crate::Session`].
///
/// The individual bits are OR-combined; for example, a server-to-server
/// session that has finished TLS and SASL negotiation might be in the state
/// `RECEIVED | SECURE | AUTHN`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionState(u8);

impl SessionState {
    /// No bits set.
    pub const EMPTY: SessionState = SessionState(0);

    /// The session was received, ie. we are the responder and the peer is
    /// the initiating entity.
    pub const RECEIVED: SessionState = SessionState(1);

    /// Transport confidentiality has been negotiated (for instance via
    /// STARTTLS).
    pub const SECURE: SessionState = SessionState(1 << 1);

    /// The peer has been authenticated.
    pub const AUTHN: SessionState = SessionState(1 << 2);

    /// Stream feature negotiation is complete and the session is ready to
    /// exchange stanzas.
    pub const READY: SessionState = SessionState(1 << 3);

    /// The input stream has been closed; reading tokens will fail.
    pub const INPUT_STREAM_CLOSED: SessionState = SessionState(1 << 4);

    /// The output stream has been closed; writing tokens will fail.
    pub const OUTPUT_STREAM_CLOSED: SessionState = SessionState(1 << 5);

    /// Returns whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: SessionState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs a state mask from its raw bit representation.
    pub const fn from_bits(bits: u8) -> SessionState {
        SessionState(bits)
    }
}

impl BitOr for SessionState {
    type Output = SessionState;

    fn bitor(self, rhs: SessionState) -> SessionState {
        SessionState(self.0 | rhs.0)
    }
}

impl BitOrAssign for SessionState {
    fn bitor_assign(&mut self, rhs: SessionState) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SessionState {
    type Output = SessionState;

    fn bitand(self, rhs: SessionState) -> SessionState {
        SessionState(self.0 & rhs.0)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SessionState, &str); 6] = [
            (SessionState::RECEIVED, "Received"),
            (SessionState::SECURE, "Secure"),
            (SessionState::AUTHN, "Authn"),
            (SessionState::READY, "Ready"),
            (SessionState::INPUT_STREAM_CLOSED, "InputStreamClosed"),
            (SessionState::OUTPUT_STREAM_CLOSED, "OutputStreamClosed"),
        ];

        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("Empty")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_masks_contain_their_bits() {
        let state = SessionState::RECEIVED | SessionState::SECURE;
        assert!(state.contains(SessionState::RECEIVED));
        assert!(state.contains(SessionState::SECURE));
        assert!(!state.contains(SessionState::AUTHN));
        assert!(state.contains(SessionState::EMPTY));
    }

    #[test]
    fn bits_round_trip() {
        for bits in 0..=0x3f {
            let state = SessionState::from_bits(bits);
            assert_eq!(state.bits(), bits);
        }
    }

    #[test]
    fn debug_names() {
        assert_eq!(format!("{:?}", SessionState::EMPTY), "Empty");
        assert_eq!(
            format!("{:?}", SessionState::SECURE | SessionState::AUTHN),
            "Secure|Authn"
        );
    }
}
