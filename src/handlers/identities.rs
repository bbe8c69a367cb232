//! REQUEST_IDENTITIES (spec §4.6).

use tracing::warn;

use crate::agent::AgentState;
use crate::card::{CardDriver, SlotId};
use crate::wire::{opcode, Encoding};

pub fn handle<D: CardDriver>(state: &mut AgentState<D>) -> Vec<u8> {
    if let Err(e) = state.session.open_refreshing_if_stale(&mut state.pin_store) {
        warn!(error = %e, "failed to open card session for REQUEST_IDENTITIES");
        state.session.close(true);
        return vec![opcode::FAILURE];
    }

    // Key-Management (0x9D) goes last regardless of discovery order (spec
    // §4.6, §8 invariant 4) so naive clients iterating keys don't try to
    // sign with it before the signing slots.
    let mut slots: Vec<_> = state.session.slots().to_vec();
    slots.sort_by_key(|s| s.id == SlotId::KeyManagement);

    let mut out = Vec::new();
    out.put_u8(opcode::IDENTITIES_ANSWER);
    out.put_u32(slots.len() as u32);
    for slot in &slots {
        out.put_string(&slot.public_key.to_blob());
        let comment = format!("PIV_slot_{:02x} {}", slot.id.byte(), slot.subject);
        out.put_string(comment.as_bytes());
    }

    state.session.close(false);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, Config};
    use crate::authz::ConfirmMode;
    use crate::card::fake::FakeCard;
    use crate::wire::Reader;

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

    /// Decodes the actual `IDENTITIES_ANSWER` payload rather than just the
    /// sort key in isolation, so a regression in the wire encoding (not only
    /// in `sort_by_key`) would also fail this test (spec §8 invariant 4).
    #[test]
    fn key_management_slot_is_last_in_the_encoded_payload() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC])
            .with_slot(SlotId::KeyManagement, "cn=km")
            .with_slot(SlotId::Authentication, "cn=auth")
            .with_slot(SlotId::Signature, "cn=sig");
        let mut state = AgentState::new(card, config());

        let out = handle(&mut state);

        let mut r = Reader::new(&out);
        assert_eq!(r.read_u8().unwrap(), opcode::IDENTITIES_ANSWER);
        let count = r.read_u32().unwrap();
        assert_eq!(count, 3);

        let mut comments = Vec::new();
        for _ in 0..count {
            r.read_string().unwrap();
            let comment = r.read_string().unwrap().to_vec();
            comments.push(String::from_utf8(comment).unwrap());
        }

        assert!(
            comments.last().unwrap().starts_with("PIV_slot_9d"),
            "expected Key-Management slot last, got {:?}",
            comments
        );
    }
}
