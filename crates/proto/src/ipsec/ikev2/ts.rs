//! IKEv2 Traffic Selectors
//!
//! Implements the traffic-selector algebra used during CHILD_SA
//! negotiation (RFC 7296 Section 3.13): construction, intersection,
//! list narrowing and the host-address substitution applied for
//! transport mode behind NAT.
//!
//! A selector bounds the flows an SA protects:
//!
//! ```text
//! (protocol, start_port..=end_port, start_addr..=end_addr [, label])
//! ```
//!
//! Lists are ordered; narrowing preserves the peer's ordering as a
//! preference.

use crate::ipsec::{Error, Result};
use ironwire_platform::FlowSelector;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Security label attached to a traffic selector (RFC 9478)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecLabel {
    value: String,
}

impl SecLabel {
    /// Create a label from its string form
    pub fn new(value: impl Into<String>) -> Self {
        SecLabel {
            value: value.into(),
        }
    }

    /// The label's string form
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for SecLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A single traffic selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    /// IP protocol (0 for any)
    pub protocol: u8,
    /// First port of the covered range
    pub start_port: u16,
    /// Last port of the covered range
    pub end_port: u16,
    /// First address of the covered range
    pub start_addr: IpAddr,
    /// Last address of the covered range
    pub end_addr: IpAddr,
    /// Optional security label
    pub label: Option<SecLabel>,
}

impl TrafficSelector {
    /// Create a new selector covering an address and port range
    pub fn new(
        protocol: u8,
        start_port: u16,
        end_port: u16,
        start_addr: IpAddr,
        end_addr: IpAddr,
    ) -> Result<Self> {
        if start_addr.is_ipv4() != end_addr.is_ipv4() {
            return Err(Error::InvalidParameter(
                "traffic selector endpoints must share an address family".into(),
            ));
        }
        if addr_to_u128(&start_addr) > addr_to_u128(&end_addr) {
            return Err(Error::InvalidParameter(
                "traffic selector address range is inverted".into(),
            ));
        }
        if start_port > end_port {
            return Err(Error::InvalidParameter(
                "traffic selector port range is inverted".into(),
            ));
        }
        Ok(TrafficSelector {
            protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
            label: None,
        })
    }

    /// Selector covering a single host, all ports
    pub fn host(addr: IpAddr) -> Self {
        TrafficSelector {
            protocol: 0,
            start_port: 0,
            end_port: u16::MAX,
            start_addr: addr,
            end_addr: addr,
            label: None,
        }
    }

    /// Selector covering a CIDR subnet, all ports
    pub fn subnet(addr: IpAddr, prefix: u8) -> Result<Self> {
        let bits = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > bits {
            return Err(Error::InvalidParameter(format!(
                "prefix length {} exceeds address width {}",
                prefix, bits
            )));
        }
        let value = addr_to_u128(&addr);
        let host_bits = u32::from(bits - prefix);
        let mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        let start = value & !mask;
        let end = start | mask;
        TrafficSelector::new(
            0,
            0,
            u16::MAX,
            u128_to_addr(start, addr.is_ipv4()),
            u128_to_addr(end, addr.is_ipv4()),
        )
    }

    /// Selector covering all IPv4 addresses and ports
    pub fn ipv4_any() -> Self {
        TrafficSelector {
            protocol: 0,
            start_port: 0,
            end_port: u16::MAX,
            start_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            end_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            label: None,
        }
    }

    /// Selector covering all IPv6 addresses and ports
    pub fn ipv6_any() -> Self {
        TrafficSelector {
            protocol: 0,
            start_port: 0,
            end_port: u16::MAX,
            start_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            end_addr: IpAddr::V6(Ipv6Addr::new(
                0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
            )),
            label: None,
        }
    }

    /// Attach a security label
    pub fn with_label(mut self, label: SecLabel) -> Self {
        self.label = Some(label);
        self
    }

    /// Restrict to a protocol and port range
    pub fn with_ports(mut self, protocol: u8, start_port: u16, end_port: u16) -> Self {
        self.protocol = protocol;
        self.start_port = start_port;
        self.end_port = end_port;
        self
    }

    /// Check if this selector covers exactly one address
    ///
    /// With a host given, that single address must equal it; with `None`
    /// any single-address selector matches.
    pub fn is_host(&self, host: Option<&IpAddr>) -> bool {
        if self.start_addr != self.end_addr {
            return false;
        }
        match host {
            Some(addr) => self.start_addr == *addr,
            None => true,
        }
    }

    /// Lowest enclosing CIDR of the address range
    ///
    /// Returns the network address and prefix length.
    pub fn to_subnet(&self) -> (IpAddr, u8) {
        let bits: u8 = if self.start_addr.is_ipv4() { 32 } else { 128 };
        let start = addr_to_u128(&self.start_addr);
        let end = addr_to_u128(&self.end_addr);

        let mut prefix = bits;
        loop {
            let host_bits = u32::from(bits - prefix);
            let mask = if host_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let net = start & !mask;
            if net == end & !mask {
                return (u128_to_addr(net, self.start_addr.is_ipv4()), prefix);
            }
            prefix -= 1;
        }
    }

    /// Collapse to a single host address, preserving protocol and ports
    pub fn set_address(&mut self, addr: IpAddr) {
        self.start_addr = addr;
        self.end_addr = addr;
    }

    /// Intersect with another selector
    ///
    /// Returns None if the protocols conflict or the port/address ranges
    /// are disjoint. Labels do not intersect; the result carries this
    /// selector's label.
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if self.start_addr.is_ipv4() != other.start_addr.is_ipv4() {
            return None;
        }
        let protocol = match (self.protocol, other.protocol) {
            (0, p) | (p, 0) => p,
            (a, b) if a == b => a,
            _ => return None,
        };

        let start_port = self.start_port.max(other.start_port);
        let end_port = self.end_port.min(other.end_port);
        if start_port > end_port {
            return None;
        }

        let start = addr_to_u128(&self.start_addr).max(addr_to_u128(&other.start_addr));
        let end = addr_to_u128(&self.end_addr).min(addr_to_u128(&other.end_addr));
        if start > end {
            return None;
        }

        Some(TrafficSelector {
            protocol,
            start_port,
            end_port,
            start_addr: u128_to_addr(start, self.start_addr.is_ipv4()),
            end_addr: u128_to_addr(end, self.start_addr.is_ipv4()),
            label: self.label.clone(),
        })
    }

    /// Convert to the flat form handed to the kernel engine
    pub fn to_flow(&self) -> FlowSelector {
        FlowSelector {
            protocol: self.protocol,
            start_port: self.start_port,
            end_port: self.end_port,
            start_addr: self.start_addr,
            end_addr: self.end_addr,
        }
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (net, prefix) = self.to_subnet();
        write!(f, "{}/{}", net, prefix)?;
        if self.protocol != 0 || self.start_port != 0 || self.end_port != u16::MAX {
            write!(
                f,
                "[{}/{}-{}]",
                self.protocol, self.start_port, self.end_port
            )?;
        }
        Ok(())
    }
}

/// Check if every selector in a list covers exactly one matching address
pub fn ts_list_is_host(list: &[TrafficSelector], host: Option<&IpAddr>) -> bool {
    !list.is_empty() && list.iter().all(|ts| ts.is_host(host))
}

/// Narrow a supplied selector list against a configured list
///
/// Yields all pairwise intersections, preserving the supplied (peer)
/// ordering as preference and dropping duplicates.
pub fn narrow_ts_lists(
    supplied: &[TrafficSelector],
    configured: &[TrafficSelector],
) -> Vec<TrafficSelector> {
    let mut result: Vec<TrafficSelector> = Vec::new();
    for sup in supplied {
        for cfg in configured {
            if let Some(ts) = sup.intersect(cfg) {
                if !result.contains(&ts) {
                    result.push(ts);
                }
            }
        }
    }
    result
}

/// Substitute a single host address into a list of host selectors
///
/// Used for transport mode behind NAT: all selectors must name the same
/// single address as the first host selector in the list; each match is
/// cloned with the address replaced. Selectors naming other hosts are
/// dropped.
pub fn substitute_host_address(
    list: &[TrafficSelector],
    addr: IpAddr,
) -> Vec<TrafficSelector> {
    let mut first: Option<IpAddr> = None;
    let mut out = Vec::new();

    for ts in list {
        if ts.is_host(first.as_ref()) {
            if first.is_none() {
                first = Some(ts.start_addr);
            }
            let mut ts = ts.clone();
            ts.set_address(addr);
            out.push(ts);
        }
    }
    out
}

fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn u128_to_addr(value: u128, ipv4: bool) -> IpAddr {
    if ipv4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_selector_construction() {
        let ts = TrafficSelector::new(6, 0, 65535, addr("10.0.0.1"), addr("10.0.0.10")).unwrap();
        assert_eq!(ts.protocol, 6);

        // Inverted range rejected
        assert!(TrafficSelector::new(0, 0, 65535, addr("10.0.0.10"), addr("10.0.0.1")).is_err());
        // Mixed families rejected
        assert!(TrafficSelector::new(0, 0, 65535, addr("10.0.0.1"), addr("::1")).is_err());
        // Inverted ports rejected
        assert!(TrafficSelector::new(0, 100, 10, addr("10.0.0.1"), addr("10.0.0.1")).is_err());
    }

    #[test]
    fn test_subnet_construction() {
        let ts = TrafficSelector::subnet(addr("10.1.2.3"), 16).unwrap();
        assert_eq!(ts.start_addr, addr("10.1.0.0"));
        assert_eq!(ts.end_addr, addr("10.1.255.255"));

        let ts = TrafficSelector::subnet(addr("10.1.2.3"), 32).unwrap();
        assert!(ts.is_host(None));

        assert!(TrafficSelector::subnet(addr("10.1.2.3"), 33).is_err());
    }

    #[test]
    fn test_is_host() {
        let host = TrafficSelector::host(addr("192.0.2.1"));
        assert!(host.is_host(None));
        assert!(host.is_host(Some(&addr("192.0.2.1"))));
        assert!(!host.is_host(Some(&addr("192.0.2.2"))));

        let range = TrafficSelector::subnet(addr("192.0.2.0"), 24).unwrap();
        assert!(!range.is_host(None));
    }

    #[test]
    fn test_to_subnet() {
        let ts = TrafficSelector::new(0, 0, 65535, addr("10.1.0.0"), addr("10.1.255.255")).unwrap();
        assert_eq!(ts.to_subnet(), (addr("10.1.0.0"), 16));

        let host = TrafficSelector::host(addr("192.0.2.7"));
        assert_eq!(host.to_subnet(), (addr("192.0.2.7"), 32));

        // Non-aligned range widens to the lowest enclosing CIDR
        let ts = TrafficSelector::new(0, 0, 65535, addr("10.0.0.1"), addr("10.0.0.2")).unwrap();
        assert_eq!(ts.to_subnet(), (addr("10.0.0.0"), 30));
    }

    #[test]
    fn test_set_address() {
        let mut ts = TrafficSelector::host(addr("10.0.0.5")).with_ports(17, 500, 500);
        ts.set_address(addr("198.51.100.1"));
        assert!(ts.is_host(Some(&addr("198.51.100.1"))));
        assert_eq!(ts.protocol, 17);
        assert_eq!(ts.start_port, 500);
    }

    #[test]
    fn test_intersect() {
        let a = TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap();
        let b = TrafficSelector::subnet(addr("10.1.0.0"), 16).unwrap();
        let i = a.intersect(&b).unwrap();
        assert_eq!(i.start_addr, addr("10.1.0.0"));
        assert_eq!(i.end_addr, addr("10.1.255.255"));

        // Disjoint
        let c = TrafficSelector::subnet(addr("192.168.0.0"), 16).unwrap();
        assert!(a.intersect(&c).is_none());

        // Protocol conflict
        let tcp = TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap().with_ports(6, 0, 65535);
        let udp = TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap().with_ports(17, 0, 65535);
        assert!(tcp.intersect(&udp).is_none());

        // Any protocol narrows to the specific one
        let any = TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap();
        assert_eq!(any.intersect(&tcp).unwrap().protocol, 6);

        // Port range intersection
        let low = any.clone().with_ports(6, 0, 1023);
        let one = any.clone().with_ports(6, 443, 443);
        let i = low.intersect(&one).unwrap();
        assert_eq!((i.start_port, i.end_port), (443, 443));
    }

    #[test]
    fn test_narrow_preserves_supplied_order() {
        let supplied = vec![
            TrafficSelector::subnet(addr("10.2.0.0"), 16).unwrap(),
            TrafficSelector::subnet(addr("10.1.0.0"), 16).unwrap(),
        ];
        let configured = vec![TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap()];

        let narrowed = narrow_ts_lists(&supplied, &configured);
        assert_eq!(narrowed.len(), 2);
        assert_eq!(narrowed[0].start_addr, addr("10.2.0.0"));
        assert_eq!(narrowed[1].start_addr, addr("10.1.0.0"));
    }

    #[test]
    fn test_narrow_empty_intersection() {
        let supplied = vec![TrafficSelector::subnet(addr("172.16.0.0"), 12).unwrap()];
        let configured = vec![TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap()];
        assert!(narrow_ts_lists(&supplied, &configured).is_empty());
    }

    #[test]
    fn test_narrow_idempotent() {
        let supplied = vec![
            TrafficSelector::subnet(addr("10.1.0.0"), 16).unwrap(),
            TrafficSelector::host(addr("10.1.2.3")).with_ports(6, 0, 1023),
        ];
        let configured = vec![TrafficSelector::subnet(addr("10.1.0.0"), 12).unwrap()];

        let once = narrow_ts_lists(&supplied, &configured);
        let twice = narrow_ts_lists(&once, &configured);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_substitute_host_address() {
        let nat = addr("203.0.113.5");
        let list = vec![
            TrafficSelector::host(addr("10.0.0.1")).with_ports(17, 500, 500),
            TrafficSelector::host(addr("10.0.0.1")).with_ports(6, 0, 65535),
        ];

        let out = substitute_host_address(&list, nat);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|ts| ts.is_host(Some(&nat))));
        assert_eq!(out[0].start_port, 500);
    }

    #[test]
    fn test_substitute_drops_foreign_hosts() {
        let list = vec![
            TrafficSelector::host(addr("10.0.0.1")),
            TrafficSelector::host(addr("10.0.0.2")),
            TrafficSelector::subnet(addr("10.0.0.0"), 24).unwrap(),
        ];
        let out = substitute_host_address(&list, addr("203.0.113.5"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_substitution_narrowing_commutes_for_hosts() {
        // When all input selectors target the single endpoint address,
        // narrowing then substituting equals substituting then
        // narrowing.
        let ike = addr("203.0.113.5");
        let supplied = vec![TrafficSelector::host(ike).with_ports(6, 80, 80)];
        let configured = vec![TrafficSelector::host(ike)];

        let narrowed_then_sub =
            substitute_host_address(&narrow_ts_lists(&supplied, &configured), ike);
        let sub_then_narrowed =
            narrow_ts_lists(&substitute_host_address(&supplied, ike), &configured);
        assert_eq!(narrowed_then_sub, sub_then_narrowed);
        assert!(!narrowed_then_sub.is_empty());
    }

    #[test]
    fn test_ts_list_is_host() {
        let h = addr("192.0.2.1");
        let list = vec![
            TrafficSelector::host(h),
            TrafficSelector::host(h).with_ports(17, 500, 500),
        ];
        assert!(ts_list_is_host(&list, Some(&h)));
        assert!(ts_list_is_host(&list, None));
        assert!(!ts_list_is_host(&[], None));

        let mixed = vec![
            TrafficSelector::host(h),
            TrafficSelector::subnet(addr("10.0.0.0"), 8).unwrap(),
        ];
        assert!(!ts_list_is_host(&mixed, None));
    }

    #[test]
    fn test_sec_label() {
        let label = SecLabel::new("system_u:object_r:ipsec_spd_t:s0");
        assert_eq!(label.as_str(), "system_u:object_r:ipsec_spd_t:s0");
        assert_eq!(label, SecLabel::new("system_u:object_r:ipsec_spd_t:s0"));
    }

    #[test]
    fn test_ipv6_selectors() {
        let ts = TrafficSelector::subnet(addr("2001:db8::1"), 64).unwrap();
        assert_eq!(ts.start_addr, addr("2001:db8::"));
        assert_eq!(
            ts.to_subnet(),
            (addr("2001:db8::"), 64)
        );

        let any = TrafficSelector::ipv6_any();
        assert_eq!(any.to_subnet(), (addr("::"), 0));
    }

    #[test]
    fn test_to_flow() {
        let ts = TrafficSelector::subnet(addr("10.0.0.0"), 24).unwrap();
        let flow = ts.to_flow();
        assert_eq!(flow.start_addr, addr("10.0.0.0"));
        assert_eq!(flow.end_addr, addr("10.0.0.255"));
        assert_eq!(flow.end_port, 65535);
    }
}
