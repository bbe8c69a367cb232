//! Per-opcode request handlers (spec §4.5-§4.9).

pub mod extension;
pub mod identities;
pub mod sign;
pub mod unlock;
