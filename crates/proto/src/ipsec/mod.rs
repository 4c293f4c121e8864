//! IPsec control plane (IKEv2 CHILD_SA negotiation)
//!
//! This module implements the CHILD_SA creation core of an IKEv2 daemon:
//! the protocol state machine that negotiates, installs and tears down
//! IPsec child security associations atop an established (or concurrently
//! establishing) IKE security association.
//!
//! # Architecture
//!
//! ```text
//! IKE engine (owns the dispatch loop)
//!   └── tasks::ChildCreate          protocol driver, one per negotiation
//!         ├── ikev2::proposal       cryptographic suite selection
//!         ├── ikev2::ts             traffic-selector narrowing
//!         ├── ikev2::ke             key-exchange sessions + multi-KE plan
//!         ├── ikev2::keymat         child key derivation (prf+)
//!         ├── child_sa              the SA under construction
//!         └── kernel / bus / scheduler   collaborators
//! ```
//!
//! The IKE engine invokes the task's `build` operation when an outbound
//! message is being composed and its `process` operation when an inbound
//! message arrives. Each returns a [`tasks::TaskStatus`]; on success the
//! task registers the installed CHILD_SA with its IKE_SA.
//!
//! # Exchanges covered
//!
//! - **IKE_AUTH** piggyback (nonces from IKE_SA_INIT, no separate KE)
//! - **CREATE_CHILD_SA** with optional PFS
//! - **IKE_FOLLOWUP_KE** rounds for additional key exchanges (RFC 9242),
//!   correlated through an opaque link token
//!
//! # Security
//!
//! - No unsafe code
//! - Derived keying material is zeroized on every control path
//! - Negotiation correlators are compared in constant time

pub mod bus;
pub mod child_sa;
pub mod config;
pub mod error;
pub mod ike_sa;
pub mod ikev2;
pub mod logging;
pub mod scheduler;
pub mod tasks;

// Re-export commonly used types
pub use child_sa::{ChildSa, ChildSaState};
pub use config::{ChildConfig, IkeConfig, PeerConfig, Settings};
pub use error::{Error, Result};
pub use tasks::{ChildCreate, TaskStatus};
