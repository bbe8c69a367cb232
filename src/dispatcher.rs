//! Message dispatcher: decodes one request frame and routes it to a
//! handler by opcode (spec §4.5).

use tracing::Span;

use crate::agent::AgentState;
use crate::authz::Decision;
use crate::card::CardDriver;
use crate::connection::Connection;
use crate::handlers;
use crate::wire::{opcode, Encoding, Reader};

pub async fn dispatch<D: CardDriver>(
    state: &mut AgentState<D>,
    conn: &mut Connection,
    frame: &[u8],
) -> Vec<u8> {
    let span = Span::current();
    let _enter = span.enter();

    let mut r = Reader::new(frame);
    let op = match r.read_u8() {
        Ok(op) => op,
        Err(_) => return vec![opcode::FAILURE],
    };

    match op {
        opcode::REQUEST_IDENTITIES => handlers::identities::handle(state),
        opcode::SIGN_REQUEST => {
            if !ensure_authorized(state, conn) {
                return vec![opcode::FAILURE];
            }
            handlers::sign::handle(state, r.remaining())
        }
        opcode::REMOVE_ALL_IDENTITIES => {
            state.pin_store.clear();
            state.session.note_pin_state(false);
            vec![opcode::SUCCESS]
        }
        opcode::LOCK => {
            state.pin_store.clear();
            state.session.note_pin_state(false);
            vec![opcode::SUCCESS]
        }
        opcode::UNLOCK => handlers::unlock::handle(state, r.remaining()),
        opcode::EXTENSION => handlers::extension::handle(state, conn, r.remaining()).await,
        _ => vec![opcode::FAILURE],
    }
}

/// Lazily resolve a connection's authorization decision on its first
/// card-using operation (spec §4.4); sticky thereafter.
pub fn ensure_authorized<D: CardDriver>(state: &AgentState<D>, conn: &mut Connection) -> bool {
    if conn.authorization == Decision::Pending {
        conn.authorization = state
            .policy
            .decide(&conn.peer, conn.is_first_connection, &state.prompter);
    }
    conn.authorization == Decision::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, Config};
    use crate::authz::ConfirmMode;
    use crate::card::fake::FakeCard;
    use crate::card::SlotId;
    use crate::keyfmt::PublicKey;
    use crate::peer_cred::PeerCred;
    use crate::wire::Encoding;

    fn config(cak: Option<PublicKey>, confirm_mode: ConfirmMode) -> Config {
        Config {
            guid_prefix: vec![0xAA, 0xBB],
            cak,
            sign_9d: false,
            confirm_mode,
            askpass: None,
            disable_uid_check: true,
            disable_zone_check: true,
            hash_name: None,
        }
    }

    fn peer(exe: &str, pid: i32) -> PeerCred {
        PeerCred {
            uid: 0,
            gid: 0,
            pid,
            start_time: 0,
            exe_path: Some(exe.to_string()),
            argv: None,
        }
    }

    async fn conn(peer: PeerCred, is_first: bool) -> Connection {
        let (a, _b) = tokio::net::UnixStream::pair().unwrap();
        Connection::new(a, peer, is_first)
    }

    #[tokio::test]
    async fn cold_list_ordering_survives_full_dispatch() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC])
            .with_slot(SlotId::KeyManagement, "cn=km")
            .with_slot(SlotId::Signature, "cn=sig");
        let mut state = AgentState::new(card, config(None, ConfirmMode::Never));
        let mut c = conn(peer("/usr/bin/ssh", 1), true).await;

        let frame = vec![opcode::REQUEST_IDENTITIES];
        let out = dispatch(&mut state, &mut c, &frame).await;

        let mut r = Reader::new(&out);
        assert_eq!(r.read_u8().unwrap(), opcode::IDENTITIES_ANSWER);
        let count = r.read_u32().unwrap();
        let mut comments = Vec::new();
        for _ in 0..count {
            r.read_string().unwrap();
            comments.push(String::from_utf8_lossy(r.read_string().unwrap()).into_owned());
        }
        assert!(comments.last().unwrap().starts_with("PIV_slot_9d"));
    }

    /// Scenario 4 (spec §8): a configured CAK that doesn't match the card's
    /// `CardAuthentication` slot must fail `REQUEST_IDENTITIES` rather than
    /// silently trusting a substituted card.
    #[tokio::test]
    async fn cak_mismatch_fails_request_identities() {
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC]).with_slot(SlotId::Authentication, "cn=auth");
        let configured_cak = PublicKey::Rsa {
            e: vec![1, 0, 1],
            n: vec![9, 9, 9],
        };
        let mut state = AgentState::new(card, config(Some(configured_cak), ConfirmMode::Never));
        let mut c = conn(peer("/usr/bin/ssh", 1), true).await;

        let frame = vec![opcode::REQUEST_IDENTITIES];
        let out = dispatch(&mut state, &mut c, &frame).await;

        assert_eq!(out, vec![opcode::FAILURE]);
    }

    /// Scenario 5 (spec §8): a forwarded ssh client's second connection
    /// with no confirm helper configured must be denied, not merely
    /// unauthorized-by-default.
    #[tokio::test]
    async fn forwarded_ssh_second_connection_is_denied() {
        std::env::remove_var("SSH_ASKPASS");
        std::env::remove_var("SSH_CONFIRM");
        let card = FakeCard::new(vec![0xAA, 0xBB, 0xCC])
            .with_slot(SlotId::Authentication, "cn=auth")
            .with_pin(b"123456");
        let mut state = AgentState::new(card, config(None, ConfirmMode::Forwarded));
        let key_blob = PublicKey::Ec {
            curve: crate::keyfmt::EcCurve::NistP256,
            point: vec![0x04; 65],
        }
        .to_blob();
        let mut payload = vec![opcode::SIGN_REQUEST];
        payload.put_string(&key_blob);
        payload.put_string(b"data");
        payload.put_u32(0);

        let mut c = conn(peer("/usr/bin/ssh", 2), false).await;
        let out = dispatch(&mut state, &mut c, &payload).await;

        assert_eq!(out, vec![opcode::FAILURE]);
    }
}
