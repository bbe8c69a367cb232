//! `attest` extension (spec §4.9): vendor attestation for a slot's key.

use tracing::warn;

use crate::agent::AgentState;
use crate::card::CardDriver;
use crate::connection::Connection;
use crate::dispatcher::ensure_authorized;
use crate::keyfmt::PublicKey;
use crate::wire::{opcode, Encoding, Reader};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>, conn: &mut Connection, payload: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let parsed = (|| -> Result<_, crate::error::ProtocolError> {
        let pubkey_blob = r.read_string()?.to_vec();
        let flags = r.read_u32()?;
        Ok((pubkey_blob, flags))
    })();
    let (pubkey_blob, flags) = match parsed {
        Ok(v) => v,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if flags != 0 {
        warn!(flags, "attest extension called with non-zero flags");
        return vec![opcode::EXT_FAILURE];
    }

    let key = match PublicKey::parse(&pubkey_blob) {
        Ok(k) => k,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    if !ensure_authorized(state, conn) {
        return vec![opcode::EXT_FAILURE];
    }

    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for attest extension");
        return vec![opcode::EXT_FAILURE];
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
            return vec![opcode::EXT_FAILURE];
        }
    };

    let (attestation, chain_head) = match state.session.attest(slot) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "card attestation failed");
            state.session.close(false);
            return vec![opcode::EXT_FAILURE];
        }
    };
    state.session.close(false);

    let mut out = Vec::new();
    out.put_u8(opcode::SUCCESS);
    out.put_string(&attestation);
    out.put_string(&chain_head);
    out
}
