//! UNLOCK (spec §4.8).

use tracing::warn;

use crate::agent::AgentState;
use crate::card::CardDriver;
use crate::error::PinError;
use crate::wire::{opcode, Reader};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>, payload: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let password = match r.read_string() {
        Ok(p) => p.to_vec(),
        Err(_) => return vec![opcode::FAILURE],
    };

    if state.pin_store.set(&password).is_err() {
        warn!("rejecting password, not a valid PIV PIN format");
        return vec![opcode::FAILURE];
    }

    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for UNLOCK");
        state.pin_store.clear();
        return vec![opcode::FAILURE];
    }

    let result = state.session.try_pin(false, &mut state.pin_store, &state.prompter);
    state.session.close(false);

    match result {
        Ok(()) => vec![opcode::SUCCESS],
        Err(PinError::InvalidPin(remaining)) => {
            warn!(remaining, "UNLOCK rejected, wrong PIN");
            vec![opcode::FAILURE]
        }
        Err(PinError::TokenLocked) => {
            warn!("UNLOCK rejected, card PIN is locked");
            vec![opcode::FAILURE]
        }
        Err(PinError::NoPin) => vec![opcode::FAILURE],
    }
}
