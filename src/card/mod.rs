//! Smartcard driver boundary.
//!
//! `CardDriver` is the trait the rest of the crate programs against; the
//! `pcsc`-backed implementation in `pcsc_driver` and the in-memory
//! `fake::FakeCard` used by tests are its only two implementors. Slot
//! identifiers and the verify-PIN outcome taxonomy mirror the PIV slot
//! layout spec §GLOSSARY describes (`Slot`, `CAK`).

pub mod fake;
pub mod pcsc_driver;
pub mod session;

use crate::keyfmt::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Authentication,
    Signature,
    KeyManagement,
    CardAuthentication,
    Other(u8),
}

impl SlotId {
    pub fn byte(&self) -> u8 {
        match self {
            SlotId::Authentication => 0x9A,
            SlotId::Signature => 0x9C,
            SlotId::KeyManagement => 0x9D,
            SlotId::CardAuthentication => 0x9E,
            SlotId::Other(b) => *b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0x9A => SlotId::Authentication,
            0x9C => SlotId::Signature,
            0x9D => SlotId::KeyManagement,
            0x9E => SlotId::CardAuthentication,
            other => SlotId::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub public_key: PublicKey,
    pub subject: String,
}

/// Result of a verify-PIN call at the driver level, distinct from
/// `CardError` because `try_pin` needs the attempts-remaining count to
/// decide between `InvalidPIN(n)` and `TokenLocked` (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub enum VerifyOutcome {
    Ok,
    PermissionError { remaining: u8 },
    MinRetriesError,
}

/// Everything the card-session state machine asks of a concrete driver.
/// Implementations own the exclusive PC/SC (or equivalent) transaction
/// once `begin_transaction` succeeds, until `end_transaction` is called.
pub trait CardDriver {
    /// Enumerate attached cards' GUIDs (hex-decoded, full bytes).
    fn list_attached(&mut self) -> Result<Vec<Vec<u8>>, crate::error::CardError>;

    fn begin_transaction(&mut self, guid: &[u8]) -> Result<(), crate::error::CardError>;

    fn end_transaction(&mut self);

    /// Application-select plus read of every slot certificate the card
    /// discloses; slots that answer NotFound/NotSupported are silently
    /// skipped (spec §4.1 `open()`).
    fn read_slots(&mut self) -> Result<Vec<Slot>, crate::error::CardError>;

    fn verify_pin(&mut self, pin: &[u8], can_skip: bool) -> VerifyOutcome;

    fn sign(&mut self, slot: SlotId, digest: &[u8]) -> Result<Vec<u8>, crate::error::CardError>;

    fn ecdh(&mut self, slot: SlotId, partner_point: &[u8]) -> Result<Vec<u8>, crate::error::CardError>;

    /// Whether this card allows any slot to be configured "PIN always"
    /// (a Yubico-specific PIV extension; spec §4.7 retry heuristic).
    fn is_yubico_style(&self) -> bool;

    /// Vendor attestation for `slot`: (attestation cert DER, chain's first
    /// TLV-0x70 inner payload). Spec §4.9 `attest`.
    fn attest(&mut self, slot: SlotId) -> Result<(Vec<u8>, Vec<u8>), crate::error::CardError>;
}
