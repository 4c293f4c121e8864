//! Key exchange sessions and the multi-KE plan
//!
//! A CHILD_SA negotiation runs zero or more ephemeral key exchanges: the
//! primary KEY_EXCHANGE_METHOD from the selected proposal plus up to seven
//! ADDITIONAL_KEY_EXCHANGE methods (RFC 9370), each executed exactly once
//! in declared order. Completed sessions accumulate in slot order; the
//! concatenation of their shared secrets feeds the child key derivation.
//!
//! Sessions are opaque: a [`KeyExchange`] holds a local secret, accepts
//! the peer's public value and yields a shared secret. The shipped
//! backends cover Curve25519 ([`x25519-dalek`]) and ML-KEM-768
//! ([`ml-kem`]); for a KEM the initiator transmits the encapsulation key
//! and the responder answers with the ciphertext.
//!
//! [`x25519-dalek`]: https://docs.rs/x25519-dalek
//! [`ml-kem`]: https://docs.rs/ml-kem

use super::constants::{KeMethod, TransformType, MAX_KEY_EXCHANGES};
use super::proposal::Proposal;
use crate::ipsec::{Error, Result};
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// An ephemeral key exchange session
///
/// One session per negotiated method. The local secret is created with
/// the session; `set_public_key` applies the peer's value; once both
/// sides contributed, `shared_secret` yields the agreed secret.
pub trait KeyExchange: Send {
    /// The method this session implements
    fn method(&self) -> KeMethod;

    /// Our public value to transmit (encapsulation key or ciphertext)
    fn public_key(&self) -> Result<Vec<u8>>;

    /// Apply the peer's public value
    fn set_public_key(&mut self, data: &[u8]) -> Result<()>;

    /// The shared secret, available after `set_public_key`
    fn shared_secret(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Factory for key exchange sessions
pub trait KeProvider: Send + Sync {
    /// Create a session for a method, None if unsupported locally
    fn create(&self, method: KeMethod, initiator: bool) -> Option<Box<dyn KeyExchange>>;
}

/// Provider backed by the shipped implementations
///
/// Supports Curve25519 and ML-KEM-768.
#[derive(Debug, Default)]
pub struct DefaultKeProvider;

impl KeProvider for DefaultKeProvider {
    fn create(&self, method: KeMethod, initiator: bool) -> Option<Box<dyn KeyExchange>> {
        match method {
            KeMethod::CURVE_25519 => Some(Box::new(X25519Exchange::new())),
            KeMethod::ML_KEM_768 => Some(Box::new(MlKem768Exchange::new(initiator))),
            _ => None,
        }
    }
}

/// Curve25519 Diffie-Hellman session
pub struct X25519Exchange {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
    shared: Option<Zeroizing<Vec<u8>>>,
}

impl X25519Exchange {
    /// Create a session with a fresh ephemeral secret
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        X25519Exchange {
            secret: Some(secret),
            public,
            shared: None,
        }
    }
}

impl Default for X25519Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for X25519Exchange {
    fn method(&self) -> KeMethod {
        KeMethod::CURVE_25519
    }

    fn public_key(&self) -> Result<Vec<u8>> {
        Ok(self.public.as_bytes().to_vec())
    }

    fn set_public_key(&mut self, data: &[u8]) -> Result<()> {
        let bytes: [u8; 32] = data.try_into().map_err(|_| {
            Error::InvalidKeExchange(format!(
                "Curve25519 public value must be 32 bytes, got {}",
                data.len()
            ))
        })?;
        let secret = self
            .secret
            .take()
            .ok_or_else(|| Error::InvalidState("peer public value already applied".into()))?;
        let shared = secret.diffie_hellman(&PublicKey::from(bytes));
        self.shared = Some(Zeroizing::new(shared.as_bytes().to_vec()));
        Ok(())
    }

    fn shared_secret(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.shared
            .clone()
            .ok_or_else(|| Error::InvalidState("key exchange not completed".into()))
    }
}

type MlKemDk = <MlKem768 as KemCore>::DecapsulationKey;
type MlKemEk = <MlKem768 as KemCore>::EncapsulationKey;

enum MlKemRole {
    /// Holds the decapsulation key, transmits the encapsulation key
    Initiator { dk: MlKemDk, ek_bytes: Vec<u8> },
    /// Encapsulates against the peer's key, transmits the ciphertext
    Responder { ct_bytes: Option<Vec<u8>> },
}

/// ML-KEM-768 session (FIPS 203)
pub struct MlKem768Exchange {
    role: MlKemRole,
    shared: Option<Zeroizing<Vec<u8>>>,
}

impl MlKem768Exchange {
    /// Create a session for the given negotiation role
    pub fn new(initiator: bool) -> Self {
        let role = if initiator {
            let (dk, ek) = MlKem768::generate(&mut OsRng);
            MlKemRole::Initiator {
                dk,
                ek_bytes: ek.as_bytes().to_vec(),
            }
        } else {
            MlKemRole::Responder { ct_bytes: None }
        };
        MlKem768Exchange { role, shared: None }
    }
}

impl KeyExchange for MlKem768Exchange {
    fn method(&self) -> KeMethod {
        KeMethod::ML_KEM_768
    }

    fn public_key(&self) -> Result<Vec<u8>> {
        match &self.role {
            MlKemRole::Initiator { ek_bytes, .. } => Ok(ek_bytes.clone()),
            MlKemRole::Responder { ct_bytes } => ct_bytes.clone().ok_or_else(|| {
                Error::InvalidState("no ciphertext before the peer's encapsulation key".into())
            }),
        }
    }

    fn set_public_key(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.role {
            MlKemRole::Initiator { dk, .. } => {
                let ct = ml_kem::Ciphertext::<MlKem768>::try_from(data).map_err(|_| {
                    Error::InvalidKeExchange(format!(
                        "ML-KEM-768 ciphertext has invalid length {}",
                        data.len()
                    ))
                })?;
                let shared = dk.decapsulate(&ct).map_err(|_| {
                    Error::InvalidKeExchange("ML-KEM-768 decapsulation failed".into())
                })?;
                self.shared = Some(Zeroizing::new(shared.to_vec()));
            }
            MlKemRole::Responder { ct_bytes } => {
                let encoded = Encoded::<MlKemEk>::try_from(data).map_err(|_| {
                    Error::InvalidKeExchange(format!(
                        "ML-KEM-768 encapsulation key has invalid length {}",
                        data.len()
                    ))
                })?;
                let ek = MlKemEk::from_bytes(&encoded);
                let (ct, shared) = ek.encapsulate(&mut OsRng).map_err(|_| {
                    Error::InvalidKeExchange("ML-KEM-768 encapsulation failed".into())
                })?;
                *ct_bytes = Some(ct.to_vec());
                self.shared = Some(Zeroizing::new(shared.to_vec()));
            }
        }
        Ok(())
    }

    fn shared_secret(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.shared
            .clone()
            .ok_or_else(|| Error::InvalidState("key exchange not completed".into()))
    }
}

/// One slot of the multi-KE plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeSlot {
    /// The transform type this method was negotiated under
    pub transform_type: TransformType,
    /// The negotiated method
    pub method: KeMethod,
    /// Whether this exchange completed
    pub done: bool,
}

/// The ordered key exchange plan of a negotiation
///
/// Slot 0 holds the primary KEY_EXCHANGE_METHOD; slots 1..=7 the
/// ADDITIONAL_KEY_EXCHANGE methods in transform-type order. An empty
/// plan means no PFS.
#[derive(Debug, Clone, Default)]
pub struct KePlan {
    slots: Vec<KeSlot>,
}

impl KePlan {
    /// Build the plan from a selected proposal
    ///
    /// Additional key exchanges must form a dense prefix: a gap, or an
    /// additional method without a primary one, is a malformed plan.
    pub fn from_proposal(proposal: &Proposal) -> Result<KePlan> {
        let mut slots = Vec::new();

        match proposal.get_algorithm(TransformType::Ke) {
            Some(alg) if alg != 0 => slots.push(KeSlot {
                transform_type: TransformType::Ke,
                method: KeMethod(alg),
                done: false,
            }),
            _ => {
                // No PFS; additional methods without a primary are malformed
                for n in 1..MAX_KEY_EXCHANGES {
                    if let Some(t) = TransformType::additional_ke(n) {
                        if proposal.get_transform(t).is_some() {
                            return Err(Error::MalformedKePlan(format!(
                                "{:?} without KEY_EXCHANGE_METHOD",
                                t
                            )));
                        }
                    }
                }
                return Ok(KePlan::default());
            }
        }

        let mut gap_at: Option<TransformType> = None;
        for n in 1..MAX_KEY_EXCHANGES {
            let Some(transform_type) = TransformType::additional_ke(n) else {
                break;
            };
            match proposal.get_algorithm(transform_type) {
                Some(alg) if alg != 0 => {
                    if let Some(gap) = gap_at {
                        return Err(Error::MalformedKePlan(format!(
                            "{:?} present but {:?} absent",
                            transform_type, gap
                        )));
                    }
                    slots.push(KeSlot {
                        transform_type,
                        method: KeMethod(alg),
                        done: false,
                    });
                }
                _ => {
                    if gap_at.is_none() {
                        gap_at = Some(transform_type);
                    }
                }
            }
        }

        debug!(exchanges = slots.len(), "determined key exchange plan");
        Ok(KePlan { slots })
    }

    /// Whether the plan requires no key exchange at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of planned exchanges
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Access a slot
    pub fn slot(&self, index: usize) -> Option<&KeSlot> {
        self.slots.get(index)
    }

    /// The first unfinished slot, if any
    pub fn next_pending(&self) -> Option<(usize, KeMethod)> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, s)| !s.done)
            .map(|(i, s)| (i, s.method))
    }

    /// Mark a slot as completed
    pub fn mark_done(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.done = true;
        }
    }

    /// Whether every planned exchange completed
    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|s| s.done)
    }

    /// Reset completion state and drop all slots
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Deterministic key exchange for tests
///
/// The shared secret is the XOR of both sides' one-byte public values,
/// repeated to a fixed width, so peers agree without real cryptography.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    static NEXT_LOCAL: AtomicU8 = AtomicU8::new(1);

    /// Deterministic [`KeyExchange`] accepting any method
    pub struct MockKe {
        method: KeMethod,
        local: u8,
        peer: Option<u8>,
    }

    impl MockKe {
        /// Create a mock session for a method
        pub fn new(method: KeMethod) -> Self {
            MockKe {
                method,
                local: NEXT_LOCAL.fetch_add(1, Ordering::Relaxed),
                peer: None,
            }
        }
    }

    impl KeyExchange for MockKe {
        fn method(&self) -> KeMethod {
            self.method
        }

        fn public_key(&self) -> Result<Vec<u8>> {
            Ok(vec![self.local])
        }

        fn set_public_key(&mut self, data: &[u8]) -> Result<()> {
            if data.len() != 1 {
                return Err(Error::InvalidKeExchange(
                    "mock public value must be one byte".into(),
                ));
            }
            self.peer = Some(data[0]);
            Ok(())
        }

        fn shared_secret(&self) -> Result<Zeroizing<Vec<u8>>> {
            let peer = self
                .peer
                .ok_or_else(|| Error::InvalidState("key exchange not completed".into()))?;
            Ok(Zeroizing::new(vec![self.local ^ peer; 32]))
        }
    }

    /// Provider creating [`MockKe`] sessions for every method
    #[derive(Debug, Default)]
    pub struct MockKeProvider {
        /// Methods to refuse, simulating missing local support
        pub unsupported: Vec<KeMethod>,
    }

    impl KeProvider for MockKeProvider {
        fn create(&self, method: KeMethod, _initiator: bool) -> Option<Box<dyn KeyExchange>> {
            if method.is_none() || self.unsupported.contains(&method) {
                return None;
            }
            Some(Box::new(MockKe::new(method)))
        }
    }
}
