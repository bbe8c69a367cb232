//! Error taxonomy (spec §7). Each enum below corresponds to one "kind" in
//! the spec, not to a single call site; handlers map these down to wire
//! response codes rather than propagating them to the client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,
    #[error("frame of {0} bytes exceeds the 262144-byte limit")]
    FrameTooLarge(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the PIN store / PIN verification path.
#[derive(Debug, Error, Clone, Copy)]
pub enum PinError {
    #[error("PIN incorrect, {0} attempt(s) remaining")]
    InvalidPin(u8),
    #[error("card PIN is locked")]
    TokenLocked,
    #[error("no PIN available and none could be obtained")]
    NoPin,
}

/// Errors from the card driver / card-session lifecycle.
#[derive(Debug, Error)]
pub enum CardError {
    #[error("no card found matching the configured GUID prefix")]
    NotFound,
    #[error("card enumeration failed: {0}")]
    Enumeration(String),
    #[error("requested slot is not present on the card")]
    SlotNotFound,
    #[error("card authentication key does not match configured CAK")]
    CakMismatch,
    /// The card refused a slot operation (sign/ecdh) pending PIN
    /// verification, distinct from a `verify_pin` failure: a "PIN always"
    /// slot can refuse here even though the preceding `try_pin(can_skip)`
    /// reported `Ok`, because the card only enforces the requirement at
    /// the point of use (spec §4.7 scenario 3).
    #[error("card refused the operation pending PIN verification")]
    PermissionError,
    #[error("driver error: {0}")]
    Driver(String),
    #[error(transparent)]
    Pin(#[from] PinError),
}
