//! `rebox` extension (spec §4.9): open a sealed box with the local card and
//! re-seal its plaintext to a different partner, optionally re-stamping
//! the destination card/slot.

use tracing::warn;
use zeroize::Zeroize;

use crate::agent::AgentState;
use crate::card::{CardDriver, SlotId};
use crate::connection::Connection;
use crate::dispatcher::ensure_authorized;
use crate::eboxfmt::SealedBox;
use crate::error::PinError;
use crate::keyfmt::PublicKey;
use crate::wire::{opcode, Encoding, Reader};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>, conn: &mut Connection, payload: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let parsed = (|| -> Result<_, crate::error::ProtocolError> {
        let sealed_box_bytes = r.read_string()?.to_vec();
        let dest_guid = r.read_string()?.to_vec();
        let dest_slot_id = r.read_u8()?;
        let partner_pubkey = r.read_string()?.to_vec();
        let flags = r.read_u32()?;
        Ok((sealed_box_bytes, dest_guid, dest_slot_id, partner_pubkey, flags))
    })();
    let (sealed_box_bytes, dest_guid, dest_slot_id, partner_pubkey, flags) = match parsed {
        Ok(v) => v,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if flags != 0 {
        warn!(flags, "rebox extension called with non-zero flags");
        return vec![opcode::EXT_FAILURE];
    }

    let sealed = match SealedBox::decode(&sealed_box_bytes) {
        Ok(b) => b,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if !ensure_authorized(state, conn) {
        return vec![opcode::EXT_FAILURE];
    }

    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for rebox extension");
        return vec![opcode::EXT_FAILURE];
    }

    if !sealed.guid.is_empty() && !state.session.guid_matches(&sealed.guid) {
        warn!("rebox: sealed box references a different card than the one currently selected");
        state.session.close(false);
        return vec![opcode::EXT_FAILURE];
    }

    let slot = SlotId::from_byte(sealed.slot_id);
    let own_point = match state.session.slots().iter().find(|s| s.id == slot) {
        Some(s) => match &s.public_key {
            PublicKey::Ec { point, .. } => point.clone(),
            PublicKey::Rsa { .. } => {
                state.session.close(false);
                return vec![opcode::EXT_FAILURE];
            }
        },
        None => {
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };

    // Authorized using the Key-Management slot's identity regardless of
    // which slot the box was sealed to (spec §4.9).
    if let Err(e) = state.session.try_pin(true, &mut state.pin_store, &state.prompter) {
        state.session.close(false);
        return match e {
            PinError::NoPin | PinError::InvalidPin(_) | PinError::TokenLocked => {
                vec![opcode::EXT_FAILURE]
            }
        };
    }

    // Sealing addressed this box to `slot`'s own ECDH public point
    // (spec §4.9 `rebox`); opening redoes that ECDH against the same
    // point to recover the shared secret the box was encrypted with.
    let mut own_secret = match state.session.ecdh(slot, &own_point) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "card ecdh operation failed while opening sealed box");
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };

    let plaintext = match sealed.open(&own_secret) {
        Ok(p) => p,
        Err(_) => {
            own_secret.zeroize();
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };
    own_secret.zeroize();
    state.session.close(false);

    let new_slot_id = if dest_guid.is_empty() { sealed.slot_id } else { dest_slot_id };
    // `seal_offline` takes ownership of `plaintext` and zeroes it once sealed.
    let new_box = SealedBox::seal_offline(plaintext, dest_guid, new_slot_id, &partner_pubkey);

    let mut out = Vec::new();
    out.put_u8(opcode::SUCCESS);
    out.put_string(&new_box.encode());
    out
}
