//! `query` extension: lists supported extension names. Never touches the
//! card, so it does not go through `ensure_authorized`.

use crate::handlers::extension::SUPPORTED;
use crate::wire::{opcode, Encoding};

pub fn handle() -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u8(opcode::SUCCESS);
    out.put_u32(SUPPORTED.len() as u32);
    for name in SUPPORTED {
        out.put_string(name.as_bytes());
    }
    out
}
