//! `ecdh` extension (spec §4.9): raw ECDH against a card slot.

use tracing::warn;
use zeroize::Zeroize;

use crate::agent::AgentState;
use crate::card::{CardDriver, SlotId};
use crate::connection::Connection;
use crate::dispatcher::ensure_authorized;
use crate::error::PinError;
use crate::keyfmt::PublicKey;
use crate::wire::{opcode, Encoding, Reader};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>, conn: &mut Connection, payload: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let (own_blob, partner_point, flags) = match (|| -> Result<_, crate::error::ProtocolError> {
        let own = r.read_string()?.to_vec();
        let partner = r.read_string()?.to_vec();
        let flags = r.read_u32()?;
        Ok((own, partner, flags))
    })() {
        Ok(v) => v,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if flags != 0 {
        warn!(flags, "ecdh extension called with non-zero flags");
        return vec![opcode::EXT_FAILURE];
    }

    let own_key = match PublicKey::parse(&own_blob) {
        Ok(k) => k,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if !ensure_authorized(state, conn) {
        return vec![opcode::EXT_FAILURE];
    }

    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for ecdh extension");
        return vec![opcode::EXT_FAILURE];
    }

    let slot = match state
        .session
        .slots()
        .iter()
        .find(|s| s.public_key == own_key)
        .map(|s| s.id)
    {
        Some(id) => id,
        None => {
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };

    let can_skip = slot != SlotId::Signature;
    if let Err(e) = state.session.try_pin(can_skip, &mut state.pin_store, &state.prompter) {
        state.session.close(false);
        return match e {
            PinError::NoPin | PinError::InvalidPin(_) | PinError::TokenLocked => {
                vec![opcode::EXT_FAILURE]
            }
        };
    }

    let mut secret = match state.session.ecdh(slot, &partner_point) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "card ecdh operation failed");
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };
    state.session.close(false);

    let mut out = Vec::new();
    out.put_u8(opcode::SUCCESS);
    out.put_string(&secret);
    secret.zeroize();
    out
}
