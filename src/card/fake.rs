//! In-memory `CardDriver` used by unit tests, the way a driver-abstraction
//! trait should be exercised (spec §2.4 ambient test tooling).

use std::collections::HashMap;

use crate::card::{CardDriver, Slot, SlotId, VerifyOutcome};
use crate::error::CardError;
use crate::keyfmt::{EcCurve, PublicKey};

pub struct FakeCard {
    pub guid: Vec<u8>,
    pub slots: HashMap<SlotId, Slot>,
    pub pin: Option<Vec<u8>>,
    pub attempts_remaining: u8,
    pub present: bool,
    pub yubico_style: bool,
    /// If `Some`, `sign`/`ecdh` fail once then succeed, to exercise the
    /// probe-tolerates-one-transient-failure path.
    pub fail_next: bool,
    /// A slot configured as a Yubico-style "PIN always" slot: `sign`
    /// refuses it with `CardError::PermissionError` unless the most
    /// recent `verify_pin` call actually ran (`can_skip == false`),
    /// mirroring how real PIV hardware enforces PIN-always at the point
    /// of use rather than at `verify_pin` time (spec §4.7 scenario 3).
    pub pin_always_slot: Option<SlotId>,
    last_verify_forced: bool,
}

impl FakeCard {
    pub fn new(guid: Vec<u8>) -> Self {
        FakeCard {
            guid,
            slots: HashMap::new(),
            pin: None,
            attempts_remaining: 3,
            present: true,
            yubico_style: false,
            fail_next: false,
            pin_always_slot: None,
            last_verify_forced: false,
        }
    }

    pub fn with_slot(mut self, id: SlotId, subject: &str) -> Self {
        let public_key = PublicKey::Ec {
            curve: EcCurve::NistP256,
            point: vec![0x04; 65],
        };
        self.slots.insert(
            id,
            Slot {
                id,
                public_key,
                subject: subject.to_string(),
            },
        );
        self
    }

    pub fn with_pin(mut self, pin: &[u8]) -> Self {
        self.pin = Some(pin.to_vec());
        self
    }
}

impl CardDriver for FakeCard {
    fn list_attached(&mut self) -> Result<Vec<Vec<u8>>, CardError> {
        if self.present {
            Ok(vec![self.guid.clone()])
        } else {
            Ok(vec![])
        }
    }

    fn begin_transaction(&mut self, guid: &[u8]) -> Result<(), CardError> {
        if !self.present {
            return Err(CardError::NotFound);
        }
        if !self.guid.starts_with(guid) && !guid.starts_with(&self.guid) {
            return Err(CardError::NotFound);
        }
        if self.fail_next {
            self.fail_next = false;
            return Err(CardError::Driver("transient".into()));
        }
        Ok(())
    }

    fn end_transaction(&mut self) {}

    fn read_slots(&mut self) -> Result<Vec<Slot>, CardError> {
        if !self.present {
            return Err(CardError::NotFound);
        }
        Ok(self.slots.values().cloned().collect())
    }

    fn verify_pin(&mut self, pin: &[u8], can_skip: bool) -> VerifyOutcome {
        if can_skip && self.pin.as_deref() == Some(pin) {
            // Card considers itself already satisfied; no real verify
            // happens, so a PIN-always slot remains un-force-verified.
            return VerifyOutcome::Ok;
        }
        match &self.pin {
            Some(stored) if stored == pin => {
                self.last_verify_forced = true;
                VerifyOutcome::Ok
            }
            _ => {
                if self.attempts_remaining == 0 {
                    VerifyOutcome::MinRetriesError
                } else {
                    self.attempts_remaining -= 1;
                    VerifyOutcome::PermissionError {
                        remaining: self.attempts_remaining,
                    }
                }
            }
        }
    }

    fn sign(&mut self, slot: SlotId, digest: &[u8]) -> Result<Vec<u8>, CardError> {
        if !self.slots.contains_key(&slot) {
            return Err(CardError::SlotNotFound);
        }
        if self.pin_always_slot == Some(slot) && !self.last_verify_forced {
            return Err(CardError::PermissionError);
        }
        let mut sig = digest.to_vec();
        sig.extend_from_slice(b"-signed");
        Ok(sig)
    }

    fn ecdh(&mut self, slot: SlotId, partner_point: &[u8]) -> Result<Vec<u8>, CardError> {
        if !self.slots.contains_key(&slot) {
            return Err(CardError::SlotNotFound);
        }
        Ok(partner_point.to_vec())
    }

    fn is_yubico_style(&self) -> bool {
        self.yubico_style
    }

    fn attest(&mut self, slot: SlotId) -> Result<(Vec<u8>, Vec<u8>), CardError> {
        if !self.slots.contains_key(&slot) {
            return Err(CardError::SlotNotFound);
        }
        Ok((vec![0xAA], vec![0xBB]))
    }
}
