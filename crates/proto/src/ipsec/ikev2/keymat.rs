//! Keying material derivation for CHILD_SAs
//!
//! Implements the IKEv2 `prf`/`prf+` construction (RFC 7296 Section 2.13)
//! and the CHILD_SA key derivation of Section 2.17, extended for multiple
//! key exchanges (RFC 9370):
//!
//! ```text
//! KEYMAT = prf+(SK_d, g^ir(1) | ... | g^ir(n) | Ni | Nr)
//!
//! Key split:
//! SK_ei | SK_ai | SK_er | SK_ar = KEYMAT
//! ```
//!
//! The shared secrets are concatenated in key-exchange slot order; the
//! nonce order (initiator first) is invariant across roles. All derived
//! material is zeroized on drop.

use super::constants::TransformType;
use super::ke::KeyExchange;
use super::proposal::{EncrTransformId, IntegTransformId, Proposal};
use crate::ipsec::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Nonce size to use with this PRF
    pub fn nonce_size(self) -> usize {
        self.output_len().clamp(16, 256)
    }

    /// Compute PRF
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha384 => {
                let mut mac =
                    Hmac::<Sha384>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute prf+ (key expansion, RFC 7296 Section 2.13)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | ...
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// ...
    /// ```
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Zeroizing<Vec<u8>> {
        let mut output = Zeroizing::new(Vec::with_capacity(output_len));
        let mut t: Vec<u8> = Vec::new();
        let mut counter: u8 = 1;

        while output.len() < output_len {
            let mut input = Vec::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = self.compute(key, &input);
            output.extend_from_slice(&t);

            counter += 1;
        }

        output.truncate(output_len);
        output
    }
}

/// Derived CHILD_SA keying material
///
/// Wiped on drop; callers clone out nothing, the kernel interface takes
/// borrowed slices.
#[derive(Debug)]
pub struct ChildKeys {
    /// Initiator encryption key
    pub encr_i: Zeroizing<Vec<u8>>,
    /// Initiator integrity key (empty for AEAD)
    pub integ_i: Zeroizing<Vec<u8>>,
    /// Responder encryption key
    pub encr_r: Zeroizing<Vec<u8>>,
    /// Responder integrity key (empty for AEAD)
    pub integ_r: Zeroizing<Vec<u8>>,
}

/// Per-IKE_SA keying material as seen by CHILD_SA tasks
///
/// Owns the derivation key SK_d and the negotiated PRF. The IKE_SA's
/// authentication keys are not visible here.
#[derive(Debug)]
pub struct Keymat {
    prf: PrfAlgorithm,
    sk_d: Zeroizing<Vec<u8>>,
}

impl Keymat {
    /// Create keymat from the negotiated PRF and SK_d
    pub fn new(prf: PrfAlgorithm, sk_d: Vec<u8>) -> Self {
        Keymat {
            prf,
            sk_d: Zeroizing::new(sk_d),
        }
    }

    /// The negotiated PRF
    pub fn prf(&self) -> PrfAlgorithm {
        self.prf
    }

    /// Nonce size negotiated for this IKE_SA
    pub fn nonce_size(&self) -> usize {
        self.prf.nonce_size()
    }

    /// Derive CHILD_SA keys from the completed key exchanges and nonces
    ///
    /// `sessions` must be the completed exchanges in slot order; the
    /// seed concatenates their shared secrets, then the initiator and
    /// responder nonces. Key lengths follow the selected proposal.
    pub fn derive_child_keys(
        &self,
        proposal: &Proposal,
        sessions: &[Box<dyn KeyExchange>],
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<ChildKeys> {
        let encr_id = proposal
            .get_algorithm(TransformType::Encr)
            .ok_or_else(|| Error::CryptoError("proposal without encryption transform".into()))?;
        let encr = EncrTransformId::from_u16(encr_id)
            .ok_or_else(|| Error::CryptoError(format!("unsupported cipher {}", encr_id)))?;

        let integ_len = if encr.is_aead() {
            0
        } else {
            let integ_id = proposal.get_algorithm(TransformType::Integ).ok_or_else(|| {
                Error::CryptoError("non-AEAD proposal without integrity transform".into())
            })?;
            IntegTransformId::from_u16(integ_id)
                .ok_or_else(|| {
                    Error::CryptoError(format!("unsupported integrity algorithm {}", integ_id))
                })?
                .key_len()
        };
        let encr_len = encr.key_len();

        let mut seed = Zeroizing::new(Vec::new());
        for session in sessions {
            let secret = session.shared_secret()?;
            seed.extend_from_slice(&secret);
        }
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let total = 2 * encr_len + 2 * integ_len;
        let keymat = self.prf.prf_plus(&self.sk_d, &seed, total);

        let mut offset = 0;
        let mut take = |len: usize| {
            let chunk = Zeroizing::new(keymat[offset..offset + len].to_vec());
            offset += len;
            chunk
        };

        Ok(ChildKeys {
            encr_i: take(encr_len),
            integ_i: take(integ_len),
            encr_r: take(encr_len),
            integ_r: take(integ_len),
        })
    }
}
