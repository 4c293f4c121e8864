//! IKEv2 protocol constants from RFC 7296, RFC 9242 and RFC 9370

use std::fmt;

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Maximum number of ADDITIONAL_KEY_EXCHANGE transforms in a proposal
pub const MAX_ADDITIONAL_KEY_EXCHANGES: usize = 7;

/// Maximum number of key exchanges (including the initial one, if any)
pub const MAX_KEY_EXCHANGES: usize = MAX_ADDITIONAL_KEY_EXCHANGES + 1;

/// Default nonce size in bytes (overridden by the negotiated PRF)
pub const NONCE_SIZE: usize = 32;

/// Exchange Types (RFC 7296 Section 3.1, RFC 9242 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
    /// IKE_FOLLOWUP_KE exchange (44, RFC 9242)
    IkeFollowupKe = 44,
    /// No exchange scheduled (message will not be sent)
    Undefined = 255,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            44 => Some(ExchangeType::IkeFollowupKe),
            255 => Some(ExchangeType::Undefined),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    SA = 33,
    /// Key Exchange (34)
    KE = 34,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    N = 41,
    /// Delete (42)
    D = 42,
    /// Traffic Selector - Initiator (44)
    TSi = 44,
    /// Traffic Selector - Responder (45)
    TSr = 45,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::SA),
            34 => Some(PayloadType::KE),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::N),
            42 => Some(PayloadType::D),
            44 => Some(PayloadType::TSi),
            45 => Some(PayloadType::TSr),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notify message types (RFC 7296 Section 3.10.1 and extensions)
///
/// Error types occupy the range below 16384; status types the range above.
/// Unknown values are preserved so the task can apply the range rule to
/// notifies it does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyType {
    /// INVALID_SYNTAX (7)
    InvalidSyntax,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload,
    /// SINGLE_PAIR_REQUIRED (34)
    SinglePairRequired,
    /// NO_ADDITIONAL_SAS (35)
    NoAdditionalSas,
    /// INTERNAL_ADDRESS_FAILURE (36)
    InternalAddressFailure,
    /// FAILED_CP_REQUIRED (37)
    FailedCpRequired,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable,
    /// INVALID_SELECTORS (39)
    InvalidSelectors,
    /// TEMPORARY_FAILURE (43)
    TemporaryFailure,
    /// STATE_NOT_FOUND (47, RFC 9242)
    StateNotFound,
    /// IPCOMP_SUPPORTED (16387)
    IpcompSupported,
    /// USE_TRANSPORT_MODE (16391)
    UseTransportMode,
    /// ESP_TFC_PADDING_NOT_SUPPORTED (16394)
    EspTfcPaddingNotSupported,
    /// ADDITIONAL_KEY_EXCHANGE (16441, RFC 9370)
    AdditionalKeyExchange,
    /// USE_BEET_MODE (40961, private use)
    UseBeetMode,
    /// Any other notify type
    Other(u16),
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Self {
        match value {
            7 => NotifyType::InvalidSyntax,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            34 => NotifyType::SinglePairRequired,
            35 => NotifyType::NoAdditionalSas,
            36 => NotifyType::InternalAddressFailure,
            37 => NotifyType::FailedCpRequired,
            38 => NotifyType::TsUnacceptable,
            39 => NotifyType::InvalidSelectors,
            43 => NotifyType::TemporaryFailure,
            47 => NotifyType::StateNotFound,
            16387 => NotifyType::IpcompSupported,
            16391 => NotifyType::UseTransportMode,
            16394 => NotifyType::EspTfcPaddingNotSupported,
            16441 => NotifyType::AdditionalKeyExchange,
            40961 => NotifyType::UseBeetMode,
            other => NotifyType::Other(other),
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        match self {
            NotifyType::InvalidSyntax => 7,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::SinglePairRequired => 34,
            NotifyType::NoAdditionalSas => 35,
            NotifyType::InternalAddressFailure => 36,
            NotifyType::FailedCpRequired => 37,
            NotifyType::TsUnacceptable => 38,
            NotifyType::InvalidSelectors => 39,
            NotifyType::TemporaryFailure => 43,
            NotifyType::StateNotFound => 47,
            NotifyType::IpcompSupported => 16387,
            NotifyType::UseTransportMode => 16391,
            NotifyType::EspTfcPaddingNotSupported => 16394,
            NotifyType::AdditionalKeyExchange => 16441,
            NotifyType::UseBeetMode => 40961,
            NotifyType::Other(other) => other,
        }
    }

    /// Check if this is an error notify (type < 16384)
    pub fn is_error(self) -> bool {
        self.to_u16() < 16384
    }
}

impl fmt::Display for NotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyType::Other(value) => write!(f, "NOTIFY({})", value),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Transform Type (RFC 7296 Section 3.3.2, RFC 9370 Section 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Key Exchange Method (KE, formerly D-H group)
    Ke = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
    /// Additional Key Exchange 1 (RFC 9370)
    AddKe1 = 6,
    /// Additional Key Exchange 2
    AddKe2 = 7,
    /// Additional Key Exchange 3
    AddKe3 = 8,
    /// Additional Key Exchange 4
    AddKe4 = 9,
    /// Additional Key Exchange 5
    AddKe5 = 10,
    /// Additional Key Exchange 6
    AddKe6 = 11,
    /// Additional Key Exchange 7
    AddKe7 = 12,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Ke),
            5 => Some(TransformType::Esn),
            6 => Some(TransformType::AddKe1),
            7 => Some(TransformType::AddKe2),
            8 => Some(TransformType::AddKe3),
            9 => Some(TransformType::AddKe4),
            10 => Some(TransformType::AddKe5),
            11 => Some(TransformType::AddKe6),
            12 => Some(TransformType::AddKe7),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The n-th ADDITIONAL_KEY_EXCHANGE transform type (1-based)
    pub fn additional_ke(n: usize) -> Option<Self> {
        match n {
            1 => Some(TransformType::AddKe1),
            2 => Some(TransformType::AddKe2),
            3 => Some(TransformType::AddKe3),
            4 => Some(TransformType::AddKe4),
            5 => Some(TransformType::AddKe5),
            6 => Some(TransformType::AddKe6),
            7 => Some(TransformType::AddKe7),
            _ => None,
        }
    }

    /// Check if this is a key-exchange carrying transform type
    pub fn is_key_exchange(self) -> bool {
        matches!(
            self,
            TransformType::Ke
                | TransformType::AddKe1
                | TransformType::AddKe2
                | TransformType::AddKe3
                | TransformType::AddKe4
                | TransformType::AddKe5
                | TransformType::AddKe6
                | TransformType::AddKe7
        )
    }
}

/// Key exchange method identifier (Transform Type 4 values)
///
/// A thin wrapper over the 16-bit registry value: the INVALID_KE_PAYLOAD
/// notify and the KE payload carry methods we may not know by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeMethod(pub u16);

impl KeMethod {
    /// No key exchange
    pub const NONE: KeMethod = KeMethod(0);
    /// 2048-bit MODP Group (14)
    pub const MODP_2048: KeMethod = KeMethod(14);
    /// 3072-bit MODP Group (15)
    pub const MODP_3072: KeMethod = KeMethod(15);
    /// 4096-bit MODP Group (16)
    pub const MODP_4096: KeMethod = KeMethod(16);
    /// NIST P-256 (19)
    pub const ECP_256: KeMethod = KeMethod(19);
    /// NIST P-384 (20)
    pub const ECP_384: KeMethod = KeMethod(20);
    /// Curve25519 (31)
    pub const CURVE_25519: KeMethod = KeMethod(31);
    /// ML-KEM-512 (35)
    pub const ML_KEM_512: KeMethod = KeMethod(35);
    /// ML-KEM-768 (36)
    pub const ML_KEM_768: KeMethod = KeMethod(36);
    /// ML-KEM-1024 (37)
    pub const ML_KEM_1024: KeMethod = KeMethod(37);

    /// Check if no key exchange is selected
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Registry value
    pub fn to_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for KeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            KeMethod::NONE => write!(f, "NONE"),
            KeMethod::MODP_2048 => write!(f, "MODP_2048"),
            KeMethod::MODP_3072 => write!(f, "MODP_3072"),
            KeMethod::MODP_4096 => write!(f, "MODP_4096"),
            KeMethod::ECP_256 => write!(f, "ECP_256"),
            KeMethod::ECP_384 => write!(f, "ECP_384"),
            KeMethod::CURVE_25519 => write!(f, "CURVE_25519"),
            KeMethod::ML_KEM_512 => write!(f, "ML_KEM_512"),
            KeMethod::ML_KEM_768 => write!(f, "ML_KEM_768"),
            KeMethod::ML_KEM_1024 => write!(f, "ML_KEM_1024"),
            KeMethod(value) => write!(f, "KE({})", value),
        }
    }
}

/// Protocol ID for proposals (RFC 7296 Section 3.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH (Authentication Header)
    Ah = 2,
    /// ESP (Encapsulating Security Payload)
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// IP protocol number as used in kernel SA tables (50 ESP, 51 AH)
    pub fn ip_protocol(self) -> u8 {
        match self {
            ProtocolId::Esp => 50,
            ProtocolId::Ah => 51,
            ProtocolId::Ike => 0,
        }
    }
}

/// IPsec encapsulation mode of a CHILD_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecMode {
    /// Host-to-host, no inner IP header
    Transport,
    /// Full IP-in-IP encapsulation
    Tunnel,
    /// Bound End-to-End Tunnel mode
    Beet,
}

impl IpsecMode {
    /// Engine mode code (matches XFRM numbering)
    pub fn kernel_code(self) -> u8 {
        match self {
            IpsecMode::Transport => 1,
            IpsecMode::Tunnel => 2,
            IpsecMode::Beet => 4,
        }
    }
}

impl fmt::Display for IpsecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpsecMode::Transport => write!(f, "TRANSPORT"),
            IpsecMode::Tunnel => write!(f, "TUNNEL"),
            IpsecMode::Beet => write!(f, "BEET"),
        }
    }
}

/// IPComp transform identifiers (RFC 7296 Section 3.10.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpcompTransform {
    /// No compression
    None = 0,
    /// IPCOMP_OUI
    Oui = 1,
    /// DEFLATE (the only transform accepted)
    Deflate = 2,
    /// LZS
    Lzs = 3,
    /// LZJH
    Lzjh = 4,
}

impl IpcompTransform {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IpcompTransform::None),
            1 => Some(IpcompTransform::Oui),
            2 => Some(IpcompTransform::Deflate),
            3 => Some(IpcompTransform::Lzs),
            4 => Some(IpcompTransform::Lzjh),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(34), Some(ExchangeType::IkeSaInit));
        assert_eq!(ExchangeType::from_u8(36), Some(ExchangeType::CreateChildSa));
        assert_eq!(ExchangeType::from_u8(44), Some(ExchangeType::IkeFollowupKe));
        assert_eq!(ExchangeType::from_u8(99), None);

        assert_eq!(ExchangeType::IkeFollowupKe.to_u8(), 44);
    }

    #[test]
    fn test_notify_type_roundtrip() {
        for value in [7u16, 14, 17, 38, 43, 47, 16387, 16391, 16394, 16441, 40961] {
            assert_eq!(NotifyType::from_u16(value).to_u16(), value);
        }

        // Unknown values are preserved
        assert_eq!(NotifyType::from_u16(12345), NotifyType::Other(12345));
        assert_eq!(NotifyType::Other(12345).to_u16(), 12345);
    }

    #[test]
    fn test_notify_error_range() {
        assert!(NotifyType::NoProposalChosen.is_error());
        assert!(NotifyType::InvalidKePayload.is_error());
        assert!(NotifyType::Other(100).is_error());

        assert!(!NotifyType::IpcompSupported.is_error());
        assert!(!NotifyType::AdditionalKeyExchange.is_error());
        assert!(!NotifyType::Other(20000).is_error());
    }

    #[test]
    fn test_transform_type_additional_ke() {
        assert_eq!(TransformType::additional_ke(1), Some(TransformType::AddKe1));
        assert_eq!(TransformType::additional_ke(7), Some(TransformType::AddKe7));
        assert_eq!(TransformType::additional_ke(8), None);

        assert!(TransformType::Ke.is_key_exchange());
        assert!(TransformType::AddKe3.is_key_exchange());
        assert!(!TransformType::Encr.is_key_exchange());
    }

    #[test]
    fn test_ke_method() {
        assert!(KeMethod::NONE.is_none());
        assert!(!KeMethod::CURVE_25519.is_none());
        assert_eq!(KeMethod::ECP_256.to_u16(), 19);
        assert_eq!(format!("{}", KeMethod::ML_KEM_768), "ML_KEM_768");
        assert_eq!(format!("{}", KeMethod(999)), "KE(999)");
    }

    #[test]
    fn test_protocol_id() {
        assert_eq!(ProtocolId::from_u8(3), Some(ProtocolId::Esp));
        assert_eq!(ProtocolId::Esp.ip_protocol(), 50);
        assert_eq!(ProtocolId::Ah.ip_protocol(), 51);
    }

    #[test]
    fn test_ipsec_mode_kernel_code() {
        assert_eq!(IpsecMode::Transport.kernel_code(), 1);
        assert_eq!(IpsecMode::Tunnel.kernel_code(), 2);
        assert_eq!(IpsecMode::Beet.kernel_code(), 4);
    }

    #[test]
    fn test_ipcomp_transform() {
        assert_eq!(IpcompTransform::from_u8(2), Some(IpcompTransform::Deflate));
        assert_eq!(IpcompTransform::Deflate.to_u8(), 2);
        assert_eq!(IpcompTransform::from_u8(9), None);
    }
}
