//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal negotiation as defined in RFC 7296 Section 3.3,
//! including the multiple key exchange transforms of RFC 9370.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//! ```

use super::constants::{KeMethod, ProtocolId, TransformType};
use crate::ipsec::{Error, Result};

/// First transform ID of the private-use range
const PRIVATE_USE_START: u16 = 1024;

/// Transform ID for Encryption (ENCR) algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncrTransformId {
    /// AES-CBC with 128-bit key
    AesCbc128 = 12,
    /// AES-CBC with 256-bit key
    AesCbc256 = 14,
    /// AES-GCM with 128-bit key and 16-byte ICV
    AesGcm128 = 20,
    /// AES-GCM with 256-bit key and 16-byte ICV
    AesGcm256 = 21,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 28,
}

impl EncrTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(EncrTransformId::AesCbc128),
            14 => Some(EncrTransformId::AesCbc256),
            20 => Some(EncrTransformId::AesGcm128),
            21 => Some(EncrTransformId::AesGcm256),
            28 => Some(EncrTransformId::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Check if this is an AEAD cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            EncrTransformId::AesGcm128
                | EncrTransformId::AesGcm256
                | EncrTransformId::ChaCha20Poly1305
        )
    }

    /// Encryption key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            EncrTransformId::AesCbc128 | EncrTransformId::AesGcm128 => 16,
            EncrTransformId::AesCbc256
            | EncrTransformId::AesGcm256
            | EncrTransformId::ChaCha20Poly1305 => 32,
        }
    }
}

/// Transform ID for Integrity algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IntegTransformId {
    /// HMAC-SHA2-256-128 (128-bit ICV)
    HmacSha256_128 = 12,
    /// HMAC-SHA2-384-192 (192-bit ICV)
    HmacSha384_192 = 13,
    /// HMAC-SHA2-512-256 (256-bit ICV)
    HmacSha512_256 = 14,
}

impl IntegTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(IntegTransformId::HmacSha256_128),
            13 => Some(IntegTransformId::HmacSha384_192),
            14 => Some(IntegTransformId::HmacSha512_256),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Integrity key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegTransformId::HmacSha256_128 => 32,
            IntegTransformId::HmacSha384_192 => 48,
            IntegTransformId::HmacSha512_256 => 64,
        }
    }
}

/// IKE Transform
///
/// Represents a single cryptographic algorithm choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Transform ID
    pub transform_id: u16,
}

impl Transform {
    /// Create new transform
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
        }
    }

    /// Create encryption transform
    pub fn encr(id: EncrTransformId) -> Self {
        Transform::new(TransformType::Encr, id.to_u16())
    }

    /// Create integrity transform
    pub fn integ(id: IntegTransformId) -> Self {
        Transform::new(TransformType::Integ, id.to_u16())
    }

    /// Create key exchange transform
    pub fn ke(method: KeMethod) -> Self {
        Transform::new(TransformType::Ke, method.to_u16())
    }

    /// Create the n-th additional key exchange transform (1-based)
    pub fn additional_ke(n: usize, method: KeMethod) -> Self {
        let transform_type = TransformType::additional_ke(n)
            .unwrap_or(TransformType::AddKe7);
        Transform::new(transform_type, method.to_u16())
    }

    /// Check if the transform ID falls into the private-use range
    pub fn is_private(&self) -> bool {
        self.transform_id >= PRIVATE_USE_START
    }
}

/// Flags controlling proposal selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionFlags {
    /// Ignore key-exchange transforms during matching (IKE_AUTH piggyback)
    pub skip_ke: bool,
    /// Skip offered proposals containing private-use transform IDs
    pub skip_private: bool,
    /// Prefer the peer's proposal order over the configured order
    pub prefer_supplied: bool,
}

/// IKE Proposal
///
/// Represents a single proposal containing one or more transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID (IKE, ESP, AH)
    pub protocol_id: ProtocolId,

    /// SPI (0 until assigned)
    pub spi: u32,

    /// List of transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Create new proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: 0,
            transforms: Vec::new(),
        }
    }

    /// Add transform to proposal
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set the SPI
    pub fn set_spi(&mut self, spi: u32) {
        self.spi = spi;
    }

    /// Get the SPI
    pub fn spi(&self) -> u32 {
        self.spi
    }

    /// Get all transforms of a type, in declared order
    pub fn transforms_of(&self, transform_type: TransformType) -> impl Iterator<Item = &Transform> {
        self.transforms
            .iter()
            .filter(move |t| t.transform_type == transform_type)
    }

    /// Get the first transform of a type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms_of(transform_type).next()
    }

    /// Get the first algorithm of a type, if any
    pub fn get_algorithm(&self, transform_type: TransformType) -> Option<u16> {
        self.get_transform(transform_type).map(|t| t.transform_id)
    }

    /// Check if the proposal contains a specific transform
    pub fn has_transform(&self, transform_type: TransformType, transform_id: u16) -> bool {
        self.transforms_of(transform_type)
            .any(|t| t.transform_id == transform_id)
    }

    /// Check if any transform ID falls into the private-use range
    pub fn has_private_transforms(&self) -> bool {
        self.transforms.iter().any(|t| t.is_private())
    }

    /// Move the given transform to the front of its type group
    ///
    /// Returns false if the proposal does not contain the transform; the
    /// proposal is left unchanged in that case.
    pub fn promote_transform(&mut self, transform_type: TransformType, transform_id: u16) -> bool {
        let Some(pos) = self
            .transforms
            .iter()
            .position(|t| t.transform_type == transform_type && t.transform_id == transform_id)
        else {
            return false;
        };

        let transform = self.transforms.remove(pos);
        let insert_at = self
            .transforms
            .iter()
            .position(|t| t.transform_type == transform_type)
            .unwrap_or(self.transforms.len());
        self.transforms.insert(insert_at, transform);
        true
    }

    /// Strip all key-exchange transforms (for exchanges without a KE payload)
    pub fn without_ke_transforms(&self) -> Proposal {
        Proposal {
            proposal_num: self.proposal_num,
            protocol_id: self.protocol_id,
            spi: self.spi,
            transforms: self
                .transforms
                .iter()
                .filter(|t| !t.transform_type.is_key_exchange())
                .cloned()
                .collect(),
        }
    }

    /// All transform types present in this proposal, deduplicated
    fn transform_types(&self) -> Vec<TransformType> {
        let mut types: Vec<TransformType> = Vec::new();
        for t in &self.transforms {
            if !types.contains(&t.transform_type) {
                types.push(t.transform_type);
            }
        }
        types
    }

    /// Intersect this proposal with another, preferring our transform order
    ///
    /// Returns the agreed proposal or None. Every transform type present in
    /// either proposal must have a common algorithm (key-exchange types are
    /// ignored entirely with `skip_ke`).
    fn match_with(&self, other: &Proposal, skip_ke: bool) -> Option<Proposal> {
        if self.protocol_id != other.protocol_id {
            return None;
        }

        let mut types = self.transform_types();
        for t in other.transform_types() {
            if !types.contains(&t) {
                types.push(t);
            }
        }
        types.sort();

        let mut selected = Vec::new();
        for transform_type in types {
            if skip_ke && transform_type.is_key_exchange() {
                continue;
            }
            let common = self
                .transforms_of(transform_type)
                .find(|t| other.has_transform(transform_type, t.transform_id));
            match common {
                Some(t) => selected.push(t.clone()),
                None => return None,
            }
        }

        Some(Proposal {
            proposal_num: other.proposal_num,
            protocol_id: self.protocol_id,
            spi: 0,
            transforms: selected,
        })
    }
}

/// Select a proposal from the peer's offer against the configured set
///
/// Implements the selection algorithm from RFC 7296 Section 2.7: the
/// configured order is authoritative unless `prefer_supplied` is set. The
/// returned proposal carries the SPI of the offered proposal it was matched
/// against, so the caller can extract the peer's SPI before substituting
/// its own.
pub fn select_proposal(
    offered: &[Proposal],
    configured: &[Proposal],
    flags: SelectionFlags,
) -> Result<Proposal> {
    let usable: Vec<&Proposal> = offered
        .iter()
        .filter(|p| !(flags.skip_private && p.has_private_transforms()))
        .collect();

    if flags.prefer_supplied {
        for offer in &usable {
            for config in configured {
                if let Some(mut selected) = offer.match_with(config, flags.skip_ke) {
                    selected.proposal_num = offer.proposal_num;
                    selected.set_spi(offer.spi());
                    return Ok(selected);
                }
            }
        }
    } else {
        for config in configured {
            for offer in &usable {
                if let Some(mut selected) = config.match_with(offer, flags.skip_ke) {
                    selected.set_spi(offer.spi());
                    return Ok(selected);
                }
            }
        }
    }

    Err(Error::NoProposalChosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esp_proposal(num: u8) -> Proposal {
        Proposal::new(num, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::ke(KeMethod::CURVE_25519))
    }

    #[test]
    fn test_transform_creation() {
        let encr = Transform::encr(EncrTransformId::AesGcm256);
        assert_eq!(encr.transform_type, TransformType::Encr);
        assert_eq!(encr.transform_id, 21);

        let ke = Transform::ke(KeMethod::MODP_3072);
        assert_eq!(ke.transform_type, TransformType::Ke);
        assert_eq!(ke.transform_id, 15);

        let add = Transform::additional_ke(1, KeMethod::ML_KEM_768);
        assert_eq!(add.transform_type, TransformType::AddKe1);
        assert_eq!(add.transform_id, 36);
    }

    #[test]
    fn test_encr_key_lengths() {
        assert_eq!(EncrTransformId::AesGcm128.key_len(), 16);
        assert_eq!(EncrTransformId::AesGcm256.key_len(), 32);
        assert!(EncrTransformId::AesGcm128.is_aead());
        assert!(!EncrTransformId::AesCbc128.is_aead());
    }

    #[test]
    fn test_proposal_accessors() {
        let proposal = esp_proposal(1);
        assert_eq!(
            proposal.get_algorithm(TransformType::Ke),
            Some(KeMethod::CURVE_25519.to_u16())
        );
        assert!(proposal.has_transform(TransformType::Encr, 21));
        assert!(!proposal.has_transform(TransformType::Encr, 20));
        assert_eq!(proposal.get_transform(TransformType::Integ), None);
    }

    #[test]
    fn test_set_spi() {
        let mut proposal = esp_proposal(1);
        assert_eq!(proposal.spi(), 0);
        proposal.set_spi(0xdeadbeef);
        assert_eq!(proposal.spi(), 0xdeadbeef);
    }

    #[test]
    fn test_promote_transform() {
        let mut proposal = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::ke(KeMethod::MODP_3072))
            .add_transform(Transform::ke(KeMethod::ECP_256))
            .add_transform(Transform::ke(KeMethod::CURVE_25519));

        assert!(proposal.promote_transform(
            TransformType::Ke,
            KeMethod::CURVE_25519.to_u16()
        ));
        assert_eq!(
            proposal.get_algorithm(TransformType::Ke),
            Some(KeMethod::CURVE_25519.to_u16())
        );
        // Encryption transform keeps its position
        assert_eq!(proposal.transforms[0].transform_type, TransformType::Encr);
    }

    #[test]
    fn test_promote_transform_missing() {
        let mut proposal = esp_proposal(1);
        let before = proposal.clone();
        assert!(!proposal.promote_transform(
            TransformType::Ke,
            KeMethod::MODP_4096.to_u16()
        ));
        assert_eq!(proposal, before);
    }

    #[test]
    fn test_without_ke_transforms() {
        let proposal = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::ke(KeMethod::CURVE_25519))
            .add_transform(Transform::additional_ke(1, KeMethod::ML_KEM_768));

        let stripped = proposal.without_ke_transforms();
        assert_eq!(stripped.transforms.len(), 1);
        assert_eq!(stripped.transforms[0].transform_type, TransformType::Encr);
    }

    #[test]
    fn test_select_proposal_basic() {
        let offered = vec![esp_proposal(1)];
        let configured = vec![esp_proposal(1)];

        let selected =
            select_proposal(&offered, &configured, SelectionFlags::default()).unwrap();
        assert_eq!(selected.protocol_id, ProtocolId::Esp);
        assert!(selected.has_transform(TransformType::Encr, 21));
    }

    #[test]
    fn test_select_proposal_no_match() {
        let offered = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm128))];
        let configured = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))];

        let result = select_proposal(&offered, &configured, SelectionFlags::default());
        assert!(matches!(result, Err(Error::NoProposalChosen)));
    }

    #[test]
    fn test_select_proposal_carries_offered_spi() {
        let mut offer = esp_proposal(1);
        offer.set_spi(0x11223344);
        let configured = vec![esp_proposal(1)];

        let selected =
            select_proposal(&[offer], &configured, SelectionFlags::default()).unwrap();
        assert_eq!(selected.spi(), 0x11223344);
    }

    #[test]
    fn test_select_proposal_configured_preference() {
        // Peer prefers GCM-128, we prefer GCM-256; both offer both.
        let offered = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm128))
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))];
        let configured = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::encr(EncrTransformId::AesGcm128))];

        let selected =
            select_proposal(&offered, &configured, SelectionFlags::default()).unwrap();
        assert_eq!(selected.get_algorithm(TransformType::Encr), Some(21));

        let flags = SelectionFlags {
            prefer_supplied: true,
            ..Default::default()
        };
        let selected = select_proposal(&offered, &configured, flags).unwrap();
        assert_eq!(selected.get_algorithm(TransformType::Encr), Some(20));
    }

    #[test]
    fn test_select_proposal_skip_ke() {
        // Offer without KE transform against a config with one (IKE_AUTH).
        let offered = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))];
        let configured = vec![esp_proposal(1)];

        let result = select_proposal(&offered, &configured, SelectionFlags::default());
        assert!(result.is_err());

        let flags = SelectionFlags {
            skip_ke: true,
            ..Default::default()
        };
        let selected = select_proposal(&offered, &configured, flags).unwrap();
        assert_eq!(selected.get_transform(TransformType::Ke), None);
    }

    #[test]
    fn test_select_proposal_skip_private() {
        let offered = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::new(TransformType::Ke, 1025))];
        let configured = vec![Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::new(TransformType::Ke, 1025))];

        // Accepted when private algorithms are allowed
        assert!(select_proposal(&offered, &configured, SelectionFlags::default()).is_ok());

        let flags = SelectionFlags {
            skip_private: true,
            ..Default::default()
        };
        let result = select_proposal(&offered, &configured, flags);
        assert!(matches!(result, Err(Error::NoProposalChosen)));
    }

    #[test]
    fn test_select_proposal_protocol_mismatch() {
        let offered = vec![Proposal::new(1, ProtocolId::Ah)
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))];
        let configured = vec![esp_proposal(1)];

        let result = select_proposal(&offered, &configured, SelectionFlags::default());
        assert!(result.is_err());
    }
}
