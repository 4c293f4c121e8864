//! Protocol implementations for the Ironwire toolkit.
//!
//! This crate carries the IPsec control plane:
//!
//! - **IKEv2 CHILD_SA negotiation** - RFC 7296 + RFC 9242 compliant
//!   creation of IPsec child security associations, including multiple
//!   key exchanges for post-quantum hybrid schemes
//!
//! # Features
//!
//! - `ipsec` (default) - IPsec/IKEv2 support
//!
//! # Example
//!
//! ```rust
//! use ironwire_proto::ipsec::ikev2::constants::ProtocolId;
//! use ironwire_proto::ipsec::ikev2::proposal::{EncrTransformId, Proposal, Transform};
//!
//! // Build an ESP proposal offering AES-GCM-256
//! let proposal = Proposal::new(1, ProtocolId::Esp)
//!     .add_transform(Transform::encr(EncrTransformId::AesGcm256));
//! assert_eq!(proposal.protocol_id, ProtocolId::Esp);
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`hmac`, `sha2`,
//!   `x25519-dalek`, `ml-kem`)
//! - Constant-time comparison for negotiation correlators
//! - Secure memory handling with `zeroize`
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 9242](https://datatracker.ietf.org/doc/html/rfc9242) - Intermediate Exchange / IKE_FOLLOWUP_KE
//! - [RFC 9370](https://datatracker.ietf.org/doc/html/rfc9370) - Multiple Key Exchanges in IKEv2

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
