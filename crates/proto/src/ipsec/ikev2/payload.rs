//! IKEv2 Payload structures and codecs
//!
//! Implements the payloads exchanged during CHILD_SA negotiation as
//! defined in RFC 7296 Section 3.2: Security Association, Key Exchange,
//! Nonce, Traffic Selector (initiator/responder), Notify and Delete.
//!
//! Payloads form a closed set, modeled as the [`Payload`] sum type; the
//! wire codec is a matcher over type tags. Each payload serializes to its
//! body (`to_payload_data`) and parses back from it (`from_payload_data`),
//! with the generic 4-byte header handled by [`PayloadHeader`].

use super::constants::{
    IpcompTransform, KeMethod, NotifyType, PayloadType, ProtocolId, TransformType,
};
use super::proposal::{Proposal, Transform};
use super::ts::{SecLabel, TrafficSelector};
use crate::ipsec::{Error, Result};
use bytes::BufMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type
    pub next_payload: PayloadType,

    /// Critical bit (if set, must understand this payload)
    pub critical: bool,

    /// Total payload length including header (4 bytes + data)
    pub length: u16,
}

impl PayloadHeader {
    /// Payload header size
    pub const SIZE: usize = 4;

    /// Create new payload header
    pub fn new(next_payload: PayloadType, critical: bool, length: u16) -> Self {
        PayloadHeader {
            next_payload,
            critical,
            length,
        }
    }

    /// Parse payload header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let next_payload = PayloadType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown payload type: {}", data[0])))?;
        let critical = (data[1] & 0x80) != 0;
        let length = u16::from_be_bytes([data[2], data[3]]);

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload,
            critical,
            length,
        })
    }

    /// Serialize payload header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload.to_u8();
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data (16-256 bytes of random data)
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size
    pub const MAX_SIZE: usize = 256;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too short: {} bytes (minimum {})",
                nonce.len(),
                Self::MIN_SIZE
            )));
        }
        if nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too long: {} bytes (maximum {})",
                nonce.len(),
                Self::MAX_SIZE
            )));
        }
        Ok(NoncePayload { nonce })
    }

    /// Parse nonce payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Serialize nonce payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.nonce.clone()
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
///
/// ```text
/// |   Key Exchange Method Num     |           RESERVED            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Key Exchange Data                       |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Key exchange method this public value belongs to
    pub method: KeMethod,

    /// Key exchange data (public value or KEM ciphertext)
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create new KE payload
    pub fn new(method: KeMethod, key_data: Vec<u8>) -> Self {
        KePayload { method, key_data }
    }

    /// Parse KE payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let method = KeMethod(u16::from_be_bytes([data[0], data[1]]));
        let key_data = data[4..].to_vec();
        Ok(KePayload { method, key_data })
    }

    /// Serialize KE payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.key_data.len());
        data.put_u16(self.method.to_u16());
        data.put_u16(0);
        data.extend_from_slice(&self.key_data);
        data
    }
}

/// Security Association Payload (RFC 7296 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Proposals, in preference order
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create an SA payload from a list of proposals
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }

    /// Create an SA payload carrying a single selected proposal
    pub fn from_proposal(proposal: Proposal) -> Self {
        SaPayload {
            proposals: vec![proposal],
        }
    }

    /// Parse SA payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        let mut proposals = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(Error::BufferTooShort {
                    required: 8,
                    available: rest.len(),
                });
            }
            let more = rest[0];
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if length < 8 || rest.len() < length {
                return Err(Error::InvalidLength {
                    expected: length,
                    actual: rest.len(),
                });
            }
            let proposal_num = rest[4];
            let protocol_id = ProtocolId::from_u8(rest[5]).ok_or_else(|| {
                Error::InvalidPayload(format!("Unknown protocol ID: {}", rest[5]))
            })?;
            let spi_size = rest[6] as usize;
            let num_transforms = rest[7] as usize;

            if rest.len() < 8 + spi_size {
                return Err(Error::BufferTooShort {
                    required: 8 + spi_size,
                    available: rest.len(),
                });
            }
            let spi = match spi_size {
                0 => 0,
                4 => u32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]),
                other => {
                    return Err(Error::InvalidPayload(format!(
                        "Unsupported SPI size: {}",
                        other
                    )))
                }
            };

            let mut proposal = Proposal::new(proposal_num, protocol_id);
            proposal.set_spi(spi);

            let mut transforms = &rest[8 + spi_size..length];
            for _ in 0..num_transforms {
                if transforms.len() < 8 {
                    return Err(Error::BufferTooShort {
                        required: 8,
                        available: transforms.len(),
                    });
                }
                let t_length = u16::from_be_bytes([transforms[2], transforms[3]]) as usize;
                let t_type = TransformType::from_u8(transforms[4]).ok_or_else(|| {
                    Error::InvalidPayload(format!("Unknown transform type: {}", transforms[4]))
                })?;
                let t_id = u16::from_be_bytes([transforms[6], transforms[7]]);
                if t_length < 8 || transforms.len() < t_length {
                    return Err(Error::InvalidLength {
                        expected: t_length,
                        actual: transforms.len(),
                    });
                }
                proposal = proposal.add_transform(Transform::new(t_type, t_id));
                transforms = &transforms[t_length..];
            }

            proposals.push(proposal);
            rest = &rest[length..];

            if more == 0 {
                break;
            }
        }

        if proposals.is_empty() {
            return Err(Error::InvalidPayload("SA payload without proposals".into()));
        }
        Ok(SaPayload { proposals })
    }

    /// Serialize SA payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for (i, proposal) in self.proposals.iter().enumerate() {
            let last = i == self.proposals.len() - 1;
            let spi_size: usize = if proposal.spi() != 0 { 4 } else { 0 };

            let mut transforms = Vec::new();
            for (j, transform) in proposal.transforms.iter().enumerate() {
                let t_last = j == proposal.transforms.len() - 1;
                transforms.put_u8(if t_last { 0 } else { 3 });
                transforms.put_u8(0);
                transforms.put_u16(8);
                transforms.put_u8(transform.transform_type.to_u8());
                transforms.put_u8(0);
                transforms.put_u16(transform.transform_id);
            }

            data.put_u8(if last { 0 } else { 2 });
            data.put_u8(0);
            data.put_u16((8 + spi_size + transforms.len()) as u16);
            data.put_u8(proposal.proposal_num);
            data.put_u8(proposal.protocol_id.to_u8());
            data.put_u8(spi_size as u8);
            data.put_u8(proposal.transforms.len() as u8);
            if spi_size == 4 {
                data.put_u32(proposal.spi());
            }
            data.extend_from_slice(&transforms);
        }
        data
    }
}

/// Individual traffic selector types (RFC 7296 Section 3.13.1, RFC 9478)
const TS_IPV4_ADDR_RANGE: u8 = 7;
const TS_IPV6_ADDR_RANGE: u8 = 8;
const TS_SECLABEL: u8 = 10;

/// Traffic Selector Payload (RFC 7296 Section 3.13)
///
/// Carries the selector list plus any security labels (RFC 9478); the
/// same structure backs both TSi and TSr.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsPayload {
    /// Selectors, in preference order
    pub selectors: Vec<TrafficSelector>,
    /// Security labels proposed alongside the selectors
    pub labels: Vec<SecLabel>,
}

impl TsPayload {
    /// Create a TS payload from selectors and an optional label
    pub fn new(selectors: Vec<TrafficSelector>, label: Option<SecLabel>) -> Self {
        TsPayload {
            selectors,
            labels: label.into_iter().collect(),
        }
    }

    /// Parse TS payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let count = data[0] as usize;
        let mut rest = &data[4..];
        let mut selectors = Vec::new();
        let mut labels = Vec::new();

        for _ in 0..count {
            if rest.len() < 4 {
                return Err(Error::BufferTooShort {
                    required: 4,
                    available: rest.len(),
                });
            }
            let ts_type = rest[0];
            let protocol = rest[1];
            let length = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if length < 4 || rest.len() < length {
                return Err(Error::InvalidLength {
                    expected: length,
                    actual: rest.len(),
                });
            }
            let body = &rest[4..length];

            match ts_type {
                TS_IPV4_ADDR_RANGE => {
                    if body.len() != 12 {
                        return Err(Error::InvalidLength {
                            expected: 12,
                            actual: body.len(),
                        });
                    }
                    let start_port = u16::from_be_bytes([body[0], body[1]]);
                    let end_port = u16::from_be_bytes([body[2], body[3]]);
                    let start: [u8; 4] = body[4..8].try_into().unwrap_or_default();
                    let end: [u8; 4] = body[8..12].try_into().unwrap_or_default();
                    selectors.push(TrafficSelector::new(
                        protocol,
                        start_port,
                        end_port,
                        IpAddr::V4(Ipv4Addr::from(start)),
                        IpAddr::V4(Ipv4Addr::from(end)),
                    )?);
                }
                TS_IPV6_ADDR_RANGE => {
                    if body.len() != 36 {
                        return Err(Error::InvalidLength {
                            expected: 36,
                            actual: body.len(),
                        });
                    }
                    let start_port = u16::from_be_bytes([body[0], body[1]]);
                    let end_port = u16::from_be_bytes([body[2], body[3]]);
                    let start: [u8; 16] = body[4..20].try_into().unwrap_or_default();
                    let end: [u8; 16] = body[20..36].try_into().unwrap_or_default();
                    selectors.push(TrafficSelector::new(
                        protocol,
                        start_port,
                        end_port,
                        IpAddr::V6(Ipv6Addr::from(start)),
                        IpAddr::V6(Ipv6Addr::from(end)),
                    )?);
                }
                TS_SECLABEL => {
                    let text = String::from_utf8(body.to_vec()).map_err(|_| {
                        Error::InvalidPayload("security label is not valid UTF-8".into())
                    })?;
                    labels.push(SecLabel::new(text));
                }
                other => {
                    return Err(Error::InvalidPayload(format!(
                        "Unknown traffic selector type: {}",
                        other
                    )));
                }
            }
            rest = &rest[length..];
        }

        Ok(TsPayload { selectors, labels })
    }

    /// Serialize TS payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.put_u8((self.selectors.len() + self.labels.len()) as u8);
        data.put_u8(0);
        data.put_u16(0);

        for ts in &self.selectors {
            match (ts.start_addr, ts.end_addr) {
                (IpAddr::V4(start), IpAddr::V4(end)) => {
                    data.put_u8(TS_IPV4_ADDR_RANGE);
                    data.put_u8(ts.protocol);
                    data.put_u16(16);
                    data.put_u16(ts.start_port);
                    data.put_u16(ts.end_port);
                    data.extend_from_slice(&start.octets());
                    data.extend_from_slice(&end.octets());
                }
                (IpAddr::V6(start), IpAddr::V6(end)) => {
                    data.put_u8(TS_IPV6_ADDR_RANGE);
                    data.put_u8(ts.protocol);
                    data.put_u16(40);
                    data.put_u16(ts.start_port);
                    data.put_u16(ts.end_port);
                    data.extend_from_slice(&start.octets());
                    data.extend_from_slice(&end.octets());
                }
                _ => {}
            }
        }

        for label in &self.labels {
            let bytes = label.as_str().as_bytes();
            data.put_u8(TS_SECLABEL);
            data.put_u8(0);
            data.put_u16((4 + bytes.len()) as u16);
            data.extend_from_slice(bytes);
        }
        data
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol the notify refers to (None for IKE-wide notifies)
    pub protocol: Option<ProtocolId>,

    /// SPI the notify refers to (0 if absent)
    pub spi: u32,

    /// Notify message type
    pub notify_type: NotifyType,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Create a notify without SPI or data
    pub fn status(notify_type: NotifyType) -> Self {
        NotifyPayload {
            protocol: None,
            spi: 0,
            notify_type,
            data: Vec::new(),
        }
    }

    /// Create a notify carrying opaque data
    pub fn with_data(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol: None,
            spi: 0,
            notify_type,
            data,
        }
    }

    /// INVALID_KE_PAYLOAD notify suggesting a key exchange method
    pub fn invalid_ke(method: KeMethod) -> Self {
        NotifyPayload::with_data(
            NotifyType::InvalidKePayload,
            method.to_u16().to_be_bytes().to_vec(),
        )
    }

    /// The method suggested by an INVALID_KE_PAYLOAD notify, if well-formed
    pub fn suggested_ke_method(&self) -> Option<KeMethod> {
        if self.notify_type != NotifyType::InvalidKePayload || self.data.len() != 2 {
            return None;
        }
        Some(KeMethod(u16::from_be_bytes([self.data[0], self.data[1]])))
    }

    /// IPCOMP_SUPPORTED notify carrying a CPI and transform ID
    pub fn ipcomp_supported(cpi: u16, transform: IpcompTransform) -> Self {
        let mut data = Vec::with_capacity(3);
        data.put_u16(cpi);
        data.put_u8(transform.to_u8());
        NotifyPayload::with_data(NotifyType::IpcompSupported, data)
    }

    /// The (CPI, transform) of an IPCOMP_SUPPORTED notify, if well-formed
    pub fn ipcomp_parameters(&self) -> Option<(u16, IpcompTransform)> {
        if self.notify_type != NotifyType::IpcompSupported || self.data.len() != 3 {
            return None;
        }
        let cpi = u16::from_be_bytes([self.data[0], self.data[1]]);
        IpcompTransform::from_u8(self.data[2]).map(|t| (cpi, t))
    }

    /// Parse notify payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let protocol = if data[0] == 0 {
            None
        } else {
            Some(ProtocolId::from_u8(data[0]).ok_or_else(|| {
                Error::InvalidPayload(format!("Unknown protocol ID: {}", data[0]))
            })?)
        };
        let spi_size = data[1] as usize;
        let notify_type = NotifyType::from_u16(u16::from_be_bytes([data[2], data[3]]));

        if data.len() < 4 + spi_size {
            return Err(Error::BufferTooShort {
                required: 4 + spi_size,
                available: data.len(),
            });
        }
        let spi = match spi_size {
            0 => 0,
            4 => u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Unsupported notify SPI size: {}",
                    other
                )))
            }
        };

        Ok(NotifyPayload {
            protocol,
            spi,
            notify_type,
            data: data[4 + spi_size..].to_vec(),
        })
    }

    /// Serialize notify payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let spi_size: usize = if self.spi != 0 { 4 } else { 0 };
        let mut data = Vec::with_capacity(4 + spi_size + self.data.len());
        data.put_u8(self.protocol.map(|p| p.to_u8()).unwrap_or(0));
        data.put_u8(spi_size as u8);
        data.put_u16(self.notify_type.to_u16());
        if spi_size == 4 {
            data.put_u32(self.spi);
        }
        data.extend_from_slice(&self.data);
        data
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol: ProtocolId,

    /// SPIs to delete
    pub spis: Vec<u32>,
}

impl DeletePayload {
    /// Create a delete payload for a protocol
    pub fn new(protocol: ProtocolId, spis: Vec<u32>) -> Self {
        DeletePayload { protocol, spis }
    }

    /// Parse delete payload from body bytes
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let protocol = ProtocolId::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown protocol ID: {}", data[0])))?;
        let spi_size = data[1] as usize;
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;
        if spi_size != 4 {
            return Err(Error::InvalidPayload(format!(
                "Unsupported delete SPI size: {}",
                spi_size
            )));
        }
        if data.len() < 4 + count * 4 {
            return Err(Error::BufferTooShort {
                required: 4 + count * 4,
                available: data.len(),
            });
        }
        let spis = data[4..4 + count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(DeletePayload { protocol, spis })
    }

    /// Serialize delete payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.spis.len() * 4);
        data.put_u8(self.protocol.to_u8());
        data.put_u8(4);
        data.put_u16(self.spis.len() as u16);
        for spi in &self.spis {
            data.put_u32(*spi);
        }
        data
    }
}

/// IKE Payload sum type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Security Association payload
    Sa(SaPayload),
    /// Key Exchange payload
    Ke(KePayload),
    /// Nonce payload
    Nonce(NoncePayload),
    /// Traffic Selector payload (initiator)
    Tsi(TsPayload),
    /// Traffic Selector payload (responder)
    Tsr(TsPayload),
    /// Notify payload
    Notify(NotifyPayload),
    /// Delete payload
    Delete(DeletePayload),
}

impl Payload {
    /// Get payload type tag
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Sa(_) => PayloadType::SA,
            Payload::Ke(_) => PayloadType::KE,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Tsi(_) => PayloadType::TSi,
            Payload::Tsr(_) => PayloadType::TSr,
            Payload::Notify(_) => PayloadType::N,
            Payload::Delete(_) => PayloadType::D,
        }
    }

    /// Parse a payload body for a given type tag
    pub fn from_payload_data(payload_type: PayloadType, data: &[u8]) -> Result<Self> {
        match payload_type {
            PayloadType::SA => Ok(Payload::Sa(SaPayload::from_payload_data(data)?)),
            PayloadType::KE => Ok(Payload::Ke(KePayload::from_payload_data(data)?)),
            PayloadType::Nonce => Ok(Payload::Nonce(NoncePayload::from_payload_data(data)?)),
            PayloadType::TSi => Ok(Payload::Tsi(TsPayload::from_payload_data(data)?)),
            PayloadType::TSr => Ok(Payload::Tsr(TsPayload::from_payload_data(data)?)),
            PayloadType::N => Ok(Payload::Notify(NotifyPayload::from_payload_data(data)?)),
            PayloadType::D => Ok(Payload::Delete(DeletePayload::from_payload_data(data)?)),
            PayloadType::None => Err(Error::InvalidPayload(
                "cannot parse payload of type None".into(),
            )),
        }
    }

    /// Serialize the payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        match self {
            Payload::Sa(p) => p.to_payload_data(),
            Payload::Ke(p) => p.to_payload_data(),
            Payload::Nonce(p) => p.to_payload_data(),
            Payload::Tsi(p) | Payload::Tsr(p) => p.to_payload_data(),
            Payload::Notify(p) => p.to_payload_data(),
            Payload::Delete(p) => p.to_payload_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::proposal::EncrTransformId;

    #[test]
    fn test_payload_header_roundtrip() {
        let header = PayloadHeader::new(PayloadType::Nonce, true, 100);
        let bytes = header.to_bytes();
        let parsed = PayloadHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_payload_header_invalid() {
        assert!(matches!(
            PayloadHeader::from_bytes(&[1, 2]),
            Err(Error::BufferTooShort { .. })
        ));

        let data = [33, 0, 0, 2];
        assert!(matches!(
            PayloadHeader::from_bytes(&data),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_nonce_payload() {
        let nonce = NoncePayload::new(vec![1u8; 32]).unwrap();
        let parsed = NoncePayload::from_payload_data(&nonce.to_payload_data()).unwrap();
        assert_eq!(parsed, nonce);

        assert!(NoncePayload::new(vec![1u8; 10]).is_err());
        assert!(NoncePayload::new(vec![1u8; 300]).is_err());
    }

    #[test]
    fn test_ke_payload_roundtrip() {
        let ke = KePayload::new(KeMethod::CURVE_25519, vec![0xAA; 32]);
        let data = ke.to_payload_data();
        assert_eq!(&data[0..2], &31u16.to_be_bytes());
        assert_eq!(&data[2..4], &[0, 0]);

        let parsed = KePayload::from_payload_data(&data).unwrap();
        assert_eq!(parsed, ke);
    }

    #[test]
    fn test_sa_payload_roundtrip() {
        let mut p1 = Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm256))
            .add_transform(Transform::ke(KeMethod::CURVE_25519))
            .add_transform(Transform::additional_ke(1, KeMethod::ML_KEM_768));
        p1.set_spi(0x11223344);
        let p2 = Proposal::new(2, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrTransformId::AesGcm128));

        let sa = SaPayload::new(vec![p1, p2]);
        let parsed = SaPayload::from_payload_data(&sa.to_payload_data()).unwrap();
        assert_eq!(parsed, sa);
        assert_eq!(parsed.proposals[0].spi(), 0x11223344);
        assert_eq!(parsed.proposals[1].spi(), 0);
    }

    #[test]
    fn test_sa_payload_empty_rejected() {
        assert!(SaPayload::from_payload_data(&[]).is_err());
    }

    #[test]
    fn test_ts_payload_roundtrip() {
        let ts = TsPayload::new(
            vec![
                TrafficSelector::subnet("10.1.0.0".parse().unwrap(), 16).unwrap(),
                TrafficSelector::subnet("2001:db8::".parse().unwrap(), 64).unwrap(),
            ],
            Some(SecLabel::new("system_u:object_r:ipsec_spd_t:s0")),
        );

        let parsed = TsPayload::from_payload_data(&ts.to_payload_data()).unwrap();
        assert_eq!(parsed.selectors, ts.selectors);
        assert_eq!(parsed.labels, ts.labels);
    }

    #[test]
    fn test_notify_invalid_ke() {
        let notify = NotifyPayload::invalid_ke(KeMethod::ECP_256);
        assert_eq!(notify.data, vec![0x00, 0x13]);
        assert_eq!(notify.suggested_ke_method(), Some(KeMethod::ECP_256));

        let parsed = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(parsed.suggested_ke_method(), Some(KeMethod::ECP_256));

        // Malformed data yields no suggestion
        let bad = NotifyPayload::with_data(NotifyType::InvalidKePayload, vec![1, 2, 3]);
        assert_eq!(bad.suggested_ke_method(), None);
    }

    #[test]
    fn test_notify_ipcomp() {
        let notify = NotifyPayload::ipcomp_supported(0x4242, IpcompTransform::Deflate);
        assert_eq!(notify.data, vec![0x42, 0x42, 0x02]);
        assert_eq!(
            notify.ipcomp_parameters(),
            Some((0x4242, IpcompTransform::Deflate))
        );

        let parsed = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(parsed, notify);
    }

    #[test]
    fn test_notify_with_spi() {
        let notify = NotifyPayload {
            protocol: Some(ProtocolId::Esp),
            spi: 0xdeadbeef,
            notify_type: NotifyType::TemporaryFailure,
            data: Vec::new(),
        };
        let parsed = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(parsed, notify);
    }

    #[test]
    fn test_notify_unknown_type_preserved() {
        let notify = NotifyPayload::status(NotifyType::Other(9999));
        let parsed = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(parsed.notify_type, NotifyType::Other(9999));
    }

    #[test]
    fn test_delete_payload_roundtrip() {
        let delete = DeletePayload::new(ProtocolId::Esp, vec![0x11111111, 0x22222222]);
        let parsed = DeletePayload::from_payload_data(&delete.to_payload_data()).unwrap();
        assert_eq!(parsed, delete);
    }

    #[test]
    fn test_payload_dispatch_roundtrip() {
        let payloads = vec![
            Payload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap()),
            Payload::Ke(KePayload::new(KeMethod::CURVE_25519, vec![1; 32])),
            Payload::Notify(NotifyPayload::status(NotifyType::UseTransportMode)),
            Payload::Delete(DeletePayload::new(ProtocolId::Esp, vec![1])),
        ];

        for payload in payloads {
            let data = payload.to_payload_data();
            let parsed = Payload::from_payload_data(payload.payload_type(), &data).unwrap();
            assert_eq!(parsed, payload);
        }
    }
}
