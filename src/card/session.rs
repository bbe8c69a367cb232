//! Card-transaction lifecycle state machine (spec §4.1).
//!
//! `CardSession<D>` owns the single selected card handle and the exclusive
//! transaction, generic over `CardDriver` so tests run it against
//! `card::fake::FakeCard` instead of a real reader.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::card::{CardDriver, Slot, SlotId, VerifyOutcome};
use crate::error::{CardError, PinError};
use crate::keyfmt::PublicKey;
use crate::pin_store::PinStore;
use crate::prompter::Prompter;

/// Transaction auto-close grace period after the last activity (spec §3).
const TXN_IDLE_MS: u64 = 2000;

const PROBE_INTERVAL_NO_PIN: Duration = Duration::from_secs(120);
const PROBE_INTERVAL_WITH_PIN: Duration = Duration::from_secs(30);

/// Consecutive probe failures after which probing is suppressed until the
/// next successful `open()` (spec §4.1 "Intervals").
const PROBE_FAIL_LIMIT: u32 = 3;

pub struct CardSession<D: CardDriver> {
    driver: D,
    guid_prefix: Vec<u8>,
    cak: Option<PublicKey>,
    sign_9d: bool,

    slots: Vec<Slot>,
    current_guid: Option<Vec<u8>>,
    txn_open: bool,
    deadline: Instant,
    last_update: Instant,
    probe_fail_count: u32,
    probe_interval: Duration,
}

impl<D: CardDriver> CardSession<D> {
    pub fn new(driver: D, guid_prefix: Vec<u8>, cak: Option<PublicKey>, sign_9d: bool) -> Self {
        let now = Instant::now();
        CardSession {
            driver,
            guid_prefix,
            cak,
            sign_9d,
            slots: Vec::new(),
            current_guid: None,
            txn_open: false,
            deadline: now,
            last_update: now,
            probe_fail_count: 0,
            probe_interval: PROBE_INTERVAL_NO_PIN,
        }
    }

    pub fn is_open(&self) -> bool {
        self.txn_open
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Whether `guid` is a prefix of (or equal to) the currently selected
    /// card's full GUID. Used by the `rebox` extension to reject a sealed
    /// box that names a different card (spec §4.9).
    pub fn guid_matches(&self, guid: &[u8]) -> bool {
        match &self.current_guid {
            Some(current) => current.starts_with(guid) || guid.starts_with(current.as_slice()),
            None => false,
        }
    }

    pub fn sign_9d_allowed(&self) -> bool {
        self.sign_9d
    }

    /// Whether probing is currently suppressed (spec §4.1 "Intervals":
    /// "further probing is suppressed until the next successful open").
    /// `open()` resets `probe_fail_count` to 0 on success, lifting this.
    pub fn probing_suppressed(&self) -> bool {
        self.probe_fail_count >= PROBE_FAIL_LIMIT
    }

    /// Whether another `probe_interval` has elapsed since the last probe
    /// attempt and the loop should call `probe()`.
    pub fn probe_due(&self, now: Instant) -> bool {
        !self.probing_suppressed() && now.duration_since(self.last_update) >= self.probe_interval
    }

    /// Next instant at which the loop should wake to consider probing, or
    /// `None` while probing is suppressed. Omitting the term in that case
    /// (spec §4.10 "omitting zero terms") matters: `last_update` only ever
    /// advances inside `probe()`, so once nothing calls `probe()` again a
    /// deadline computed from it would be pinned to a timestamp that can
    /// never move forward, spinning the event loop.
    pub fn next_probe_deadline(&self) -> Option<Instant> {
        if self.probing_suppressed() {
            None
        } else {
            Some(self.last_update + self.probe_interval)
        }
    }

    /// Record that the caller is about to use the PIN store in a way that
    /// changes its cached/not-cached state; recomputes `probe_interval`
    /// (30 s with a PIN cached, 120 s otherwise).
    pub fn note_pin_state(&mut self, pin_cached: bool) {
        self.probe_interval = if pin_cached {
            PROBE_INTERVAL_WITH_PIN
        } else {
            PROBE_INTERVAL_NO_PIN
        };
    }

    /// Open (or refresh) a transaction. If a transaction is already open,
    /// only its deadline is refreshed — no re-enumeration.
    pub fn open(&mut self, pin_store: &mut PinStore) -> Result<(), CardError> {
        if self.txn_open {
            self.deadline = Instant::now() + Duration::from_millis(TXN_IDLE_MS);
            return Ok(());
        }

        self.driver.end_transaction();

        let guids = self
            .driver
            .list_attached()
            .map_err(|e| CardError::Enumeration(e.to_string()))?;
        let guid = guids
            .into_iter()
            .find(|g| g.starts_with(&self.guid_prefix))
            .ok_or(CardError::NotFound)?;

        self.driver.begin_transaction(&guid)?;
        let slots = self.driver.read_slots()?;
        self.slots = slots;
        self.current_guid = Some(guid);

        if let Err(e) = self.check_cak() {
            pin_store.clear();
            self.note_pin_state(false);
            return Err(e);
        }

        let now = Instant::now();
        self.last_update = now;
        self.deadline = now + Duration::from_millis(TXN_IDLE_MS);
        self.txn_open = true;
        self.probe_fail_count = 0;
        Ok(())
    }

    /// Open, forcing a full re-enumeration and CAK re-check if
    /// `probe_interval` has elapsed since the last activity, even if a
    /// transaction is already open (spec §4.6 "if now - last_update >=
    /// probe_interval, re-reads all certificates and re-authenticates
    /// CAK").
    pub fn open_refreshing_if_stale(&mut self, pin_store: &mut PinStore) -> Result<(), CardError> {
        if self.txn_open && Instant::now().duration_since(self.last_update) >= self.probe_interval {
            self.txn_open = false;
        }
        self.open(pin_store)
    }

    /// Close the transaction. Deferred unless `force` or the deadline has
    /// passed, so back-to-back operations can share one transaction.
    pub fn close(&mut self, force: bool) {
        if !self.txn_open {
            return;
        }
        if force || Instant::now() >= self.deadline {
            self.driver.end_transaction();
            self.txn_open = false;
        }
    }

    fn check_cak(&mut self) -> Result<(), CardError> {
        let Some(expected) = &self.cak else {
            return Ok(());
        };
        let actual = self
            .slots
            .iter()
            .find(|s| s.id == SlotId::CardAuthentication)
            .map(|s| &s.public_key);
        if actual == Some(expected) {
            Ok(())
        } else {
            Err(CardError::CakMismatch)
        }
    }

    /// PIN acquisition/verification loop shared by sign/unlock/ecdh/rebox.
    pub fn try_pin(
        &mut self,
        can_skip: bool,
        pin_store: &mut PinStore,
        prompter: &Prompter,
    ) -> Result<(), PinError> {
        if pin_store.is_empty() && !can_skip {
            if let Some(pin) = prompter.ask("Enter PIV PIN: ") {
                let _ = pin_store.set(pin.as_bytes());
            }
        }
        if pin_store.is_empty() {
            return Err(PinError::NoPin);
        }

        let outcome = self.driver.verify_pin(pin_store.as_bytes(), can_skip);
        match outcome {
            VerifyOutcome::Ok => {
                self.note_pin_state(true);
                Ok(())
            }
            VerifyOutcome::PermissionError { remaining } if remaining > 0 => {
                pin_store.clear();
                self.note_pin_state(false);
                Err(PinError::InvalidPin(remaining))
            }
            VerifyOutcome::PermissionError { .. } | VerifyOutcome::MinRetriesError => {
                pin_store.clear();
                self.note_pin_state(false);
                Err(PinError::TokenLocked)
            }
        }
    }

    /// Called by the event loop when idle has reached `probe_interval`
    /// (spec §4.1 `probe()`).
    ///
    /// `last_update` is advanced here unconditionally, before the attempt,
    /// regardless of whether it succeeds: this is what lets `probe_due`/
    /// `next_probe_deadline` keep moving forward when the card is absent
    /// or a probe fails, instead of freezing at the last successful
    /// `open()` (which only happens inside the `Ok` arm below).
    pub fn probe(&mut self, pin_store: &mut PinStore) {
        self.last_update = Instant::now();
        match self.open(pin_store) {
            Ok(()) => {
                self.probe_fail_count = 0;
            }
            Err(CardError::CakMismatch) => {
                warn!("card authentication key mismatch during probe, treating as card substitution");
                pin_store.clear();
                self.note_pin_state(false);
                self.forget_handle();
            }
            Err(e) => {
                self.probe_fail_count += 1;
                warn!(error = %e, count = self.probe_fail_count, "card probe failed");
                if self.probe_fail_count >= 2 {
                    pin_store.clear();
                    self.note_pin_state(false);
                    self.forget_handle();
                }
            }
        }
        self.close(false);
    }

    fn forget_handle(&mut self) {
        self.driver.end_transaction();
        self.txn_open = false;
        self.slots.clear();
        self.current_guid = None;
    }

    pub fn sign(&mut self, slot: SlotId, digest: &[u8]) -> Result<Vec<u8>, CardError> {
        self.driver.sign(slot, digest)
    }

    pub fn ecdh(&mut self, slot: SlotId, partner_point: &[u8]) -> Result<Vec<u8>, CardError> {
        self.driver.ecdh(slot, partner_point)
    }

    pub fn attest(&mut self, slot: SlotId) -> Result<(Vec<u8>, Vec<u8>), CardError> {
        self.driver.attest(slot)
    }

    pub fn is_yubico_style(&self) -> bool {
        self.driver.is_yubico_style()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::fake::FakeCard;

    fn session_with(card: FakeCard) -> CardSession<FakeCard> {
        CardSession::new(card, vec![0xAA, 0xBB], None, false)
    }

    #[test]
    fn open_refreshes_deadline_without_reopening() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_slot(SlotId::Authentication, "cn=test");
        let mut session = session_with(card);
        let mut pin_store = PinStore::new();
        session.open(&mut pin_store).unwrap();
        let first_deadline = session.deadline();
        session.open(&mut pin_store).unwrap();
        assert!(session.deadline() >= first_deadline);
    }

    #[test]
    fn cak_mismatch_clears_pin_and_fails_open() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_slot(SlotId::CardAuthentication, "cn=cak");
        let configured_cak = PublicKey::Rsa {
            e: vec![1, 0, 1],
            n: vec![9, 9, 9],
        };
        let mut session = CardSession::new(card, vec![0xAA, 0xBB], Some(configured_cak), false);
        let mut pin_store = PinStore::new();
        pin_store.set(b"123456").unwrap();
        let result = session.open(&mut pin_store);
        assert!(matches!(result, Err(CardError::CakMismatch)));
        assert_eq!(pin_store.len(), 0);
    }

    #[test]
    fn try_pin_with_no_cached_pin_and_no_askpass_fails() {
        std::env::remove_var("SSH_ASKPASS");
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_pin(b"123456");
        let mut session = session_with(card);
        let mut pin_store = PinStore::new();
        let prompter = Prompter::new(None);
        let result = session.try_pin(false, &mut pin_store, &prompter);
        assert!(matches!(result, Err(PinError::NoPin)));
    }

    #[test]
    fn try_pin_succeeds_with_cached_correct_pin() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_pin(b"123456");
        let mut session = session_with(card);
        let mut pin_store = PinStore::new();
        pin_store.set(b"123456").unwrap();
        let prompter = Prompter::new(None);
        assert!(session.try_pin(true, &mut pin_store, &prompter).is_ok());
        assert_eq!(session.probe_interval(), PROBE_INTERVAL_WITH_PIN);
    }

    #[test]
    fn first_probe_failure_is_tolerated_second_drops_pin() {
        let mut card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_pin(b"123456");
        card.present = false;
        let mut session = session_with(card);
        let mut pin_store = PinStore::new();
        pin_store.set(b"123456").unwrap();

        session.probe(&mut pin_store);
        assert_eq!(pin_store.len(), 6);

        session.probe(&mut pin_store);
        assert_eq!(pin_store.len(), 0);
    }
}
