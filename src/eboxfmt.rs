//! A minimal, internally-consistent sealed-box ("ecdh box") format.
//!
//! The wire format of the real sealed box is explicitly out of scope
//! (spec Out-of-scope: "sealed-box format... and its serializer"); this
//! module implements just enough of `open`/`seal_offline` to exercise the
//! `rebox` round-trip property in spec §8 — it makes no claim of
//! bit-compatibility with any external ebox implementation.

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::ProtocolError;
use crate::wire::{Encoding, Reader};

#[derive(Debug, Clone)]
pub struct SealedBox {
    pub guid: Vec<u8>,
    pub slot_id: u8,
    ciphertext: Vec<u8>,
    tag: [u8; 32],
    /// Opaque name/value pairs carried alongside the ciphertext; the real
    /// recovery-template format uses these for challenge tokens, not
    /// implemented here (that format is a separate, out-of-scope CLI
    /// collaborator).
    tokens: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, thiserror::Error)]
pub enum EboxError {
    #[error("sealed box authentication tag did not verify")]
    TagMismatch,
}

fn keystream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(shared_secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn tag_of(key: &[u8; 32], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(ciphertext);
    let digest = hasher.finalize();
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&digest);
    tag
}

impl SealedBox {
    /// Seal `plaintext` to `partner_point` (the destination slot's ECDH
    /// public point), stamping `{guid, slot_id}` for the destination card
    /// if `guid` is non-empty.
    pub fn seal_offline(mut plaintext: Vec<u8>, guid: Vec<u8>, slot_id: u8, partner_point: &[u8]) -> Self {
        let key = derive_key(partner_point);
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(keystream(&key, plaintext.len()))
            .map(|(b, k)| b ^ k)
            .collect();
        let tag = tag_of(&key, &ciphertext);
        plaintext.zeroize();
        SealedBox {
            guid,
            slot_id,
            ciphertext,
            tag,
            tokens: Vec::new(),
        }
    }

    /// Decrypt using the shared secret produced by an ECDH against the
    /// referenced slot. `own_shared_secret` plays the role of the partner
    /// point on the opening side: `card::fake::FakeCard::ecdh` returns its
    /// input unchanged, so sealing to a slot's ECDH public point and later
    /// opening with that same slot's ECDH output round-trips.
    pub fn open(&self, own_shared_secret: &[u8]) -> Result<Vec<u8>, EboxError> {
        let key = derive_key(own_shared_secret);
        if tag_of(&key, &self.ciphertext) != self.tag {
            return Err(EboxError::TagMismatch);
        }
        Ok(self
            .ciphertext
            .iter()
            .zip(keystream(&key, self.ciphertext.len()))
            .map(|(b, k)| b ^ k)
            .collect())
    }

    /// Serialize for transport over the wire (spec §4.9 `rebox`). Layout:
    /// `string guid, byte slot_id, string ciphertext, string tag, u32
    /// token_count, (string name, string value)*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_string(&self.guid);
        out.put_u8(self.slot_id);
        out.put_string(&self.ciphertext);
        out.put_string(&self.tag);
        out.put_u32(self.tokens.len() as u32);
        for (name, value) in &self.tokens {
            out.put_string(name.as_bytes());
            out.put_string(value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        let guid = r.read_string()?.to_vec();
        let slot_id = r.read_u8()?;
        let ciphertext = r.read_string()?.to_vec();
        let tag_bytes = r.read_string()?;
        if tag_bytes.len() != 32 {
            return Err(ProtocolError::Truncated);
        }
        let mut tag = [0u8; 32];
        tag.copy_from_slice(tag_bytes);
        let token_count = r.read_u32()?;
        let mut tokens = Vec::with_capacity(token_count as usize);
        for _ in 0..token_count {
            let name = String::from_utf8_lossy(r.read_string()?).into_owned();
            let value = r.read_string()?.to_vec();
            tokens.push((name, value));
        }
        Ok(SealedBox {
            guid,
            slot_id,
            ciphertext,
            tag,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_with_matching_secret_round_trips() {
        let secret = b"shared-ecdh-point";
        let box_ = SealedBox::seal_offline(b"hello world".to_vec(), vec![], 0, secret);
        let opened = box_.open(secret).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn open_with_wrong_secret_fails_tag_check() {
        let box_ = SealedBox::seal_offline(b"hello world".to_vec(), vec![], 0, b"secret-a");
        assert!(matches!(box_.open(b"secret-b"), Err(EboxError::TagMismatch)));
    }

    #[test]
    fn rebox_round_trip_via_open_and_seal_offline() {
        let secret = b"own-slot-secret";
        let mut box_ = SealedBox::seal_offline(b"top secret".to_vec(), vec![], 0, secret);
        let plaintext = box_.open(secret).unwrap();

        let partner_secret = b"partner-slot-secret";
        let rebox = SealedBox::seal_offline(plaintext, vec![0xDE, 0xAD], 1, partner_secret);
        assert_eq!(rebox.guid, vec![0xDE, 0xAD]);
        assert_eq!(rebox.slot_id, 1);
        assert_eq!(rebox.open(partner_secret).unwrap(), b"top secret");
    }

    #[test]
    fn encode_decode_round_trips() {
        let box_ = SealedBox::seal_offline(b"payload".to_vec(), vec![0xAA, 0xBB], 0x9d, b"secret");
        let bytes = box_.encode();
        let decoded = SealedBox::decode(&bytes).unwrap();
        assert_eq!(decoded.guid, box_.guid);
        assert_eq!(decoded.slot_id, box_.slot_id);
        assert_eq!(decoded.open(b"secret").unwrap(), b"payload");
    }
}
