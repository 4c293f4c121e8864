//! IKEv2 message container
//!
//! The view of a message that CHILD_SA negotiation tasks build into and
//! process from. Framing, encryption and retransmission belong to the IKE
//! engine; a task only sees the exchange type, the direction and the
//! decrypted payload list.

use super::constants::{ExchangeType, NotifyType, PayloadType};
use super::payload::{
    DeletePayload, KePayload, NoncePayload, NotifyPayload, Payload, SaPayload, TsPayload,
};

/// A decrypted IKEv2 message under construction or inspection
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    exchange_type: ExchangeType,
    request: bool,
    payloads: Vec<Payload>,
}

impl Message {
    /// Create an empty message for an exchange
    pub fn new(exchange_type: ExchangeType, request: bool) -> Self {
        Message {
            exchange_type,
            request,
            payloads: Vec::new(),
        }
    }

    /// The message's exchange type
    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    /// Change the exchange type (set to `Undefined` to suppress sending)
    pub fn set_exchange_type(&mut self, exchange_type: ExchangeType) {
        self.exchange_type = exchange_type;
    }

    /// Whether this message is a request
    pub fn is_request(&self) -> bool {
        self.request
    }

    /// All payloads in order
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Append a payload
    pub fn add_payload(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Append a notify without data
    pub fn add_notify(&mut self, notify_type: NotifyType) {
        self.payloads
            .push(Payload::Notify(NotifyPayload::status(notify_type)));
    }

    /// Append a notify carrying data
    pub fn add_notify_data(&mut self, notify_type: NotifyType, data: Vec<u8>) {
        self.payloads
            .push(Payload::Notify(NotifyPayload::with_data(notify_type, data)));
    }

    /// First payload of a given type
    pub fn get_payload(&self, payload_type: PayloadType) -> Option<&Payload> {
        self.payloads
            .iter()
            .find(|p| p.payload_type() == payload_type)
    }

    /// The SA payload, if present
    pub fn sa_payload(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        })
    }

    /// The KE payload, if present
    pub fn ke_payload(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Ke(ke) => Some(ke),
            _ => None,
        })
    }

    /// The nonce payload, if present
    pub fn nonce_payload(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(nonce) => Some(nonce),
            _ => None,
        })
    }

    /// The initiator traffic selector payload, if present
    pub fn tsi_payload(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Tsi(ts) => Some(ts),
            _ => None,
        })
    }

    /// The responder traffic selector payload, if present
    pub fn tsr_payload(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Tsr(ts) => Some(ts),
            _ => None,
        })
    }

    /// The delete payload, if present
    pub fn delete_payload(&self) -> Option<&DeletePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Delete(d) => Some(d),
            _ => None,
        })
    }

    /// All notify payloads in order
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// First notify of a given type
    pub fn get_notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.notify_type == notify_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::constants::KeMethod;

    #[test]
    fn test_message_basics() {
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert!(msg.is_request());
        assert_eq!(msg.exchange_type(), ExchangeType::CreateChildSa);

        msg.add_payload(Payload::Nonce(
            NoncePayload::new(vec![1u8; 32]).unwrap(),
        ));
        msg.add_payload(Payload::Ke(KePayload::new(
            KeMethod::CURVE_25519,
            vec![2u8; 32],
        )));

        assert!(msg.nonce_payload().is_some());
        assert_eq!(msg.ke_payload().unwrap().method, KeMethod::CURVE_25519);
        assert!(msg.sa_payload().is_none());
    }

    #[test]
    fn test_exchange_type_override() {
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        msg.set_exchange_type(ExchangeType::Undefined);
        assert_eq!(msg.exchange_type(), ExchangeType::Undefined);
    }

    #[test]
    fn test_notify_lookup() {
        let mut msg = Message::new(ExchangeType::CreateChildSa, false);
        msg.add_notify(NotifyType::UseTransportMode);
        msg.add_notify_data(NotifyType::AdditionalKeyExchange, vec![0x42]);

        assert!(msg.get_notify(NotifyType::UseTransportMode).is_some());
        assert_eq!(
            msg.get_notify(NotifyType::AdditionalKeyExchange).unwrap().data,
            vec![0x42]
        );
        assert!(msg.get_notify(NotifyType::TemporaryFailure).is_none());
        assert_eq!(msg.notifies().count(), 2);
    }
}
