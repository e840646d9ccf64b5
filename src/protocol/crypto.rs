//! Per-hop relay cell cryptography
//!
//! Implements the tor-spec crypto for circuit communication:
//! - AES-128-CTR keystreams, one pair per hop
//! - SHA-1 running digests over relay payloads
//! - HKDF-SHA256 key expansion (ntor) and KDF-TOR (fast create)
//!
//! Key material is zeroized on drop.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TorError};
use crate::protocol::cell::RELAY_DIGEST_OFFSET;

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// HKDF expansion tag for ntor key material
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Symmetric key material for one hop
///
/// Each hop has separate keys for the forward (client to relay) and
/// backward (relay to client) directions, plus the seeds of the two
/// running digests. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeyMaterial {
    /// Forward encryption key (client to relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay to client)
    pub backward_key: [u8; 16],

    /// Forward digest seed
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed
    pub backward_digest_seed: [u8; 20],
}

impl HopKeyMaterial {
    fn from_okm(okm: &[u8]) -> Self {
        let mut km = HopKeyMaterial {
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
        };
        km.forward_digest_seed.copy_from_slice(&okm[0..20]);
        km.backward_digest_seed.copy_from_slice(&okm[20..40]);
        km.forward_key.copy_from_slice(&okm[40..56]);
        km.backward_key.copy_from_slice(&okm[56..72]);
        km
    }

    /// Crypt state for cells this side sends toward the far end.
    pub fn outbound(&self) -> HopCryptState {
        HopCryptState::new(&self.forward_key, &self.forward_digest_seed)
    }

    /// Crypt state for cells this side receives from the far end.
    pub fn inbound(&self) -> HopCryptState {
        HopCryptState::new(&self.backward_key, &self.backward_digest_seed)
    }
}

/// One direction of a hop's relay-cell crypto: a CTR keystream plus the
/// running payload digest.
pub struct HopCryptState {
    cipher: Aes128Ctr,
    digest: Sha1,
}

impl HopCryptState {
    /// Create a crypt state from a key and digest seed. The CTR IV
    /// starts at zero and the running digest is seeded with the seed.
    pub fn new(key: &[u8; 16], digest_seed: &[u8; 20]) -> Self {
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), (&iv).into()),
            digest,
        }
    }

    /// Apply one keystream layer in place. CTR mode is symmetric, so
    /// this both encrypts and decrypts.
    pub fn apply_keystream(&mut self, payload: &mut [u8]) {
        self.cipher.apply_keystream(payload);
    }

    /// Stamp the running digest into a relay payload.
    ///
    /// The digest field is zeroed, the running digest advances over the
    /// whole payload, and its first four bytes land in the digest field.
    pub fn set_digest(&mut self, payload: &mut [u8]) {
        payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);
        self.digest.update(&payload[..]);
        let snapshot = self.digest.clone().finalize();
        payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].copy_from_slice(&snapshot[..4]);
    }

    /// Verify a relay payload against the running digest.
    ///
    /// The running state only advances when the payload matches, so a
    /// cell recognized at an earlier hop never desynchronizes this one.
    pub fn check_digest(&mut self, payload: &[u8]) -> bool {
        let mut scratch = payload.to_vec();
        scratch[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);

        let mut candidate = self.digest.clone();
        candidate.update(&scratch);
        let expected = candidate.clone().finalize();

        let received = &payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4];
        let matches: bool = received.ct_eq(&expected[..4]).into();
        if matches {
            self.digest = candidate;
        }
        matches
    }
}

/// Derive hop key material from an ntor KEY_SEED.
///
/// `K = HKDF-SHA256(KEY_SEED, m_expand)`, laid out as
/// `Df (20) | Db (20) | Kf (16) | Kb (16)`.
pub fn derive_ntor(key_seed: &[u8]) -> Result<HopKeyMaterial> {
    let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::KeyDerivationFailed("Invalid PRK length".into()))?;

    let mut okm = [0u8; 72];
    hkdf.expand(M_EXPAND, &mut okm)
        .map_err(|_| TorError::KeyDerivationFailed("HKDF expansion failed".into()))?;

    let km = HopKeyMaterial::from_okm(&okm);
    okm.zeroize();
    Ok(km)
}

/// Legacy KDF-TOR: `K = H(secret | [0]) | H(secret | [1]) | ...`
fn kdf_tor(secret: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut counter = 0u8;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// Derive hop key material for a fast-create handshake.
///
/// `K = KDF-TOR(X | Y)`, laid out as
/// `KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16)`. Returns the
/// derivative key `KH` (checked against the CREATED_FAST reply) and the
/// hop keys.
pub fn derive_fast(x: &[u8; 20], y: &[u8; 20]) -> ([u8; 20], HopKeyMaterial) {
    let mut secret = [0u8; 40];
    secret[..20].copy_from_slice(x);
    secret[20..].copy_from_slice(y);

    let mut okm = kdf_tor(&secret, 92);
    secret.zeroize();

    let mut kh = [0u8; 20];
    kh.copy_from_slice(&okm[0..20]);
    let km = HopKeyMaterial::from_okm(&okm[20..92]);
    okm.zeroize();
    (kh, km)
}
