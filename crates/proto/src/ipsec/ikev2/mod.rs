//! IKEv2 protocol building blocks (RFC 7296, RFC 9242, RFC 9370)
//!
//! # Submodules
//!
//! - [`constants`] - Protocol identifiers and message constants
//! - [`proposal`] - SA proposal and transform model
//! - [`ts`] - Traffic-selector algebra and narrowing
//! - [`payload`] - Payload structures and wire codecs
//! - [`message`] - Message container handed between engine and tasks
//! - [`ke`] - Key-exchange sessions and the multi-KE plan
//! - [`keymat`] - Keying material derivation for CHILD_SAs

pub mod constants;
pub mod ke;
pub mod keymat;
pub mod message;
pub mod payload;
pub mod proposal;
pub mod ts;
