//! Public-key and signature wire formats.
//!
//! Generalizes the algorithm-name/blob handling in thrussh-keys' `key.rs`
//! to the curves PIV slots actually hold. Unlike `key.rs` there is no
//! private-key variant here at all: private key material never leaves the
//! card, so this module only ever parses a public key blob handed to us by
//! the card driver (or a client's `SIGN_REQUEST`) and builds the blobs and
//! signature wire format sent back to the client.

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::ProtocolError;
use crate::wire::{Encoding, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    NistP256,
    NistP384,
    NistP521,
}

impl EcCurve {
    pub fn ssh_name(&self) -> &'static str {
        match self {
            EcCurve::NistP256 => "ecdsa-sha2-nistp256",
            EcCurve::NistP384 => "ecdsa-sha2-nistp384",
            EcCurve::NistP521 => "ecdsa-sha2-nistp521",
        }
    }

    pub fn ssh_curve_id(&self) -> &'static str {
        match self {
            EcCurve::NistP256 => "nistp256",
            EcCurve::NistP384 => "nistp384",
            EcCurve::NistP521 => "nistp521",
        }
    }

    /// Digest algorithm PIV pairs with this curve for ECDSA (spec §4.7:
    /// chosen by curve size, not negotiated with the client).
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            EcCurve::NistP256 => Sha256::digest(data).to_vec(),
            EcCurve::NistP384 => Sha384::digest(data).to_vec(),
            EcCurve::NistP521 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A public key as presented over the wire (RFC 4253 §6.6 blob, generalized
/// to the EC algorithms of RFC 5656).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Rsa { e: Vec<u8>, n: Vec<u8> },
    Ec { curve: EcCurve, point: Vec<u8> },
}

impl PublicKey {
    /// Parse a full key blob (algorithm name string plus the
    /// algorithm-specific fields), as found in a `SIGN_REQUEST` or returned
    /// by `REQUEST_IDENTITIES`.
    pub fn parse(blob: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(blob);
        let algo = r.read_string()?;
        match algo {
            b"ssh-rsa" => {
                let e = r.read_mpint()?.to_vec();
                let n = r.read_mpint()?.to_vec();
                Ok(PublicKey::Rsa { e, n })
            }
            b"ecdsa-sha2-nistp256" | b"ecdsa-sha2-nistp384" | b"ecdsa-sha2-nistp521" => {
                let curve_id = r.read_string()?;
                let point = r.read_string()?.to_vec();
                let curve = match curve_id {
                    b"nistp256" => EcCurve::NistP256,
                    b"nistp384" => EcCurve::NistP384,
                    b"nistp521" => EcCurve::NistP521,
                    _ => return Err(ProtocolError::UnknownOpcode(0)),
                };
                Ok(PublicKey::Ec { curve, point })
            }
            _ => Err(ProtocolError::UnknownOpcode(0)),
        }
    }

    /// Build the key blob (algorithm name + fields), the form sent back in
    /// `IDENTITIES_ANSWER`.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            PublicKey::Rsa { e, n } => {
                out.put_string(b"ssh-rsa");
                out.put_mpint(e);
                out.put_mpint(n);
            }
            PublicKey::Ec { curve, point } => {
                out.put_string(curve.ssh_name().as_bytes());
                out.put_string(curve.ssh_curve_id().as_bytes());
                out.put_string(point);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaHash {
    Sha1,
    Sha256,
    Sha512,
}

impl RsaHash {
    /// SIGN_REQUEST flag bits (spec §4.7 / RFC 8332).
    pub const FLAG_RSA_SHA2_256: u32 = 0x02;
    pub const FLAG_RSA_SHA2_512: u32 = 0x04;

    /// Select the hash for an RSA signature from the request's flags word.
    /// Defaults to SHA-1 when neither bit is set — preserved deliberately,
    /// not a bug (spec §9 open question 3).
    pub fn from_flags(flags: u32) -> Self {
        if flags & Self::FLAG_RSA_SHA2_512 != 0 {
            RsaHash::Sha512
        } else if flags & Self::FLAG_RSA_SHA2_256 != 0 {
            RsaHash::Sha256
        } else {
            RsaHash::Sha1
        }
    }

    pub fn ssh_algo_name(&self) -> &'static str {
        match self {
            RsaHash::Sha1 => "ssh-rsa",
            RsaHash::Sha256 => "rsa-sha2-256",
            RsaHash::Sha512 => "rsa-sha2-512",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            RsaHash::Sha1 => {
                use sha1::{Digest as _, Sha1};
                Sha1::digest(data).to_vec()
            }
            RsaHash::Sha256 => Sha256::digest(data).to_vec(),
            RsaHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A signature as returned to the client in `SIGN_RESPONSE`.
#[derive(Debug, Clone)]
pub enum Signature {
    Rsa { hash: RsaHash, sig: Vec<u8> },
    Ec { curve: EcCurve, r: Vec<u8>, s: Vec<u8> },
}

impl Signature {
    /// Encode as the `signature` blob in SIGN_RESPONSE: algorithm name
    /// string followed by the algorithm-specific signature bytes, the
    /// whole thing then wrapped once more as a string by the caller
    /// (`handlers::sign`) per the SIGN_RESPONSE framing in spec §4.7.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Signature::Rsa { hash, sig } => {
                out.put_string(hash.ssh_algo_name().as_bytes());
                out.put_string(sig);
            }
            Signature::Ec { curve, r, s } => {
                out.put_string(curve.ssh_name().as_bytes());
                let mut inner = Vec::new();
                inner.put_mpint(r);
                inner.put_mpint(s);
                out.put_string(&inner);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_hash_defaults_to_sha1_with_no_flags() {
        assert_eq!(RsaHash::from_flags(0), RsaHash::Sha1);
    }

    #[test]
    fn rsa_hash_prefers_sha512_over_sha256_when_both_set() {
        assert_eq!(
            RsaHash::from_flags(RsaHash::FLAG_RSA_SHA2_256 | RsaHash::FLAG_RSA_SHA2_512),
            RsaHash::Sha512
        );
    }

    #[test]
    fn ec_key_blob_round_trips() {
        let key = PublicKey::Ec {
            curve: EcCurve::NistP256,
            point: vec![0x04; 65],
        };
        let blob = key.to_blob();
        let parsed = PublicKey::parse(&blob).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn rsa_key_blob_round_trips() {
        let key = PublicKey::Rsa {
            e: vec![0x01, 0x00, 0x01],
            n: vec![0x80, 0x01, 0x02, 0x03],
        };
        let blob = key.to_blob();
        let parsed = PublicKey::parse(&blob).unwrap();
        assert_eq!(parsed, key);
    }
}
