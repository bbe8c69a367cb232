//! Extension dispatch (spec §4.9). Frame layout: `opcode=27, string name,
//! bytes payload`. An extension that fails writes `EXT_FAILURE`, not
//! `FAILURE`, so clients can tell extension errors from protocol errors.

pub mod attest;
pub mod ecdh;
pub mod query;
pub mod rebox;

use crate::agent::AgentState;
use crate::card::CardDriver;
use crate::connection::Connection;
use crate::wire::{opcode, Reader};

pub const SUPPORTED: &[&str] = &["query", "ecdh", "rebox", "attest"];

pub async fn handle<D: CardDriver>(
    state: &mut AgentState<D>,
    conn: &mut Connection,
    payload: &[u8],
) -> Vec<u8> {
    let mut r = Reader::new(payload);
    let name = match r.read_string() {
        Ok(n) => n,
        Err(_) => return vec![opcode::EXT_FAILURE],
    };

    match name {
        b"query" => query::handle(),
        b"ecdh" => ecdh::handle(state, conn, r.remaining()),
        b"rebox" => rebox::handle(state, conn, r.remaining()),
        b"attest" => attest::handle(state, conn, r.remaining()),
        // x509-certs and anything unrecognized: stubbed as not implemented.
        _ => vec![opcode::EXT_FAILURE],
    }
}
