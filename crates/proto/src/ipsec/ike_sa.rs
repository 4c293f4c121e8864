//! IKE_SA context observed by CHILD_SA tasks
//!
//! The parent security association. CHILD_SA creation tasks borrow it
//! for the duration of one build/process round: they read the role,
//! endpoints, NAT conditions, supported extensions and keymat, and they
//! register the installed CHILD_SA with it.

use crate::ipsec::child_sa::ChildSa;
use crate::ipsec::config::{IkeConfig, PeerConfig};
use crate::ipsec::ikev2::keymat::Keymat;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_UNIQUE_ID: AtomicU32 = AtomicU32::new(1);

/// Runtime conditions of an IKE_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition;

impl Condition {
    /// We are behind a NAT
    pub const NAT_HERE: u32 = 0x0001;
    /// The peer is behind a NAT
    pub const NAT_THERE: u32 = 0x0002;
    /// NAT was faked to keep mappings alive
    pub const NAT_FAKE: u32 = 0x0004;
    /// All authentication rounds completed
    pub const AUTHENTICATED: u32 = 0x0008;
    /// This IKE_SA was redirected
    pub const REDIRECTED: u32 = 0x0010;

    /// Any NAT condition
    pub const NAT_ANY: u32 = Self::NAT_HERE | Self::NAT_THERE | Self::NAT_FAKE;
}

/// Protocol extensions a peer may support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension;

impl Extension {
    /// Peer is a strongSwan implementation (private-use notifies are safe)
    pub const STRONGSWAN: u32 = 0x0001;
    /// Peer supports childless IKE_SA initiation (RFC 6023)
    pub const IKE_CHILDLESS: u32 = 0x0002;

    /// No extensions
    pub const NONE: u32 = 0;
}

/// Coarse IKE_SA state as far as child negotiation cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IkeSaState {
    /// Busy establishing (IKE_SA_INIT / IKE_AUTH in flight)
    #[default]
    Connecting,
    /// Established and usable
    Established,
    /// An IKE rekeying is in progress
    Rekeying,
    /// A deletion is in progress
    Deleting,
}

/// The parent IKE security association
pub struct IkeSa {
    unique_id: u32,
    initiator: bool,
    my_host: IpAddr,
    other_host: IpAddr,
    virtual_ips: Vec<IpAddr>,
    other_virtual_ips: Vec<IpAddr>,
    conditions: u32,
    extensions: u32,
    if_ids: (u32, u32),
    state: IkeSaState,
    ike_cfg: Arc<IkeConfig>,
    peer_cfg: Option<Arc<PeerConfig>>,
    keymat: Keymat,
    child_sas: Vec<ChildSa>,
}

impl IkeSa {
    /// Create an IKE_SA context
    pub fn new(
        initiator: bool,
        my_host: IpAddr,
        other_host: IpAddr,
        ike_cfg: Arc<IkeConfig>,
        keymat: Keymat,
    ) -> Self {
        IkeSa {
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            initiator,
            my_host,
            other_host,
            virtual_ips: Vec::new(),
            other_virtual_ips: Vec::new(),
            conditions: 0,
            extensions: 0,
            if_ids: (0, 0),
            state: IkeSaState::default(),
            ike_cfg,
            peer_cfg: None,
            keymat,
            child_sas: Vec::new(),
        }
    }

    /// Process-unique id
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Whether this side initiated the IKE_SA
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Our IKE endpoint address
    pub fn my_host(&self) -> IpAddr {
        self.my_host
    }

    /// The peer's IKE endpoint address
    pub fn other_host(&self) -> IpAddr {
        self.other_host
    }

    /// Update the endpoints (mobility, NAT mapping changes)
    pub fn set_hosts(&mut self, my_host: IpAddr, other_host: IpAddr) {
        self.my_host = my_host;
        self.other_host = other_host;
    }

    /// Assign virtual IPs (ours or the peer's)
    pub fn add_virtual_ip(&mut self, local: bool, vip: IpAddr) {
        if local {
            self.virtual_ips.push(vip);
        } else {
            self.other_virtual_ips.push(vip);
        }
    }

    /// The addresses a dynamic selector template resolves to
    ///
    /// Virtual IPs take precedence over the IKE endpoint.
    pub fn dynamic_hosts(&self, local: bool) -> Vec<IpAddr> {
        let (vips, host) = if local {
            (&self.virtual_ips, self.my_host)
        } else {
            (&self.other_virtual_ips, self.other_host)
        };
        if vips.is_empty() {
            vec![host]
        } else {
            vips.clone()
        }
    }

    /// The configured virtual IPs we will request as initiator
    pub fn requested_virtual_ips(&self) -> Vec<IpAddr> {
        self.peer_cfg
            .as_ref()
            .map(|cfg| cfg.virtual_ips.clone())
            .unwrap_or_default()
    }

    /// Check a runtime condition
    pub fn has_condition(&self, condition: u32) -> bool {
        self.conditions & condition != 0
    }

    /// Set or clear a runtime condition
    pub fn set_condition(&mut self, condition: u32, set: bool) {
        if set {
            self.conditions |= condition;
        } else {
            self.conditions &= !condition;
        }
    }

    /// Check whether the peer supports an extension
    pub fn supports_extension(&self, extension: u32) -> bool {
        self.extensions & extension != 0
    }

    /// Record a supported extension
    pub fn enable_extension(&mut self, extension: u32) {
        self.extensions |= extension;
    }

    /// Default interface ID of a direction
    pub fn if_id(&self, inbound: bool) -> u32 {
        if inbound {
            self.if_ids.0
        } else {
            self.if_ids.1
        }
    }

    /// Set the default interface IDs
    pub fn set_if_ids(&mut self, if_id_in: u32, if_id_out: u32) {
        self.if_ids = (if_id_in, if_id_out);
    }

    /// Current coarse state
    pub fn state(&self) -> IkeSaState {
        self.state
    }

    /// Set the coarse state
    pub fn set_state(&mut self, state: IkeSaState) {
        self.state = state;
    }

    /// IKE-level configuration
    pub fn ike_cfg(&self) -> &Arc<IkeConfig> {
        &self.ike_cfg
    }

    /// Peer configuration, if resolved
    pub fn peer_cfg(&self) -> Option<&Arc<PeerConfig>> {
        self.peer_cfg.as_ref()
    }

    /// Install the peer configuration
    pub fn set_peer_cfg(&mut self, peer_cfg: Arc<PeerConfig>) {
        self.peer_cfg = Some(peer_cfg);
    }

    /// This IKE_SA's keymat
    pub fn keymat(&self) -> &Keymat {
        &self.keymat
    }

    /// Register an installed CHILD_SA
    pub fn add_child_sa(&mut self, child_sa: ChildSa) {
        self.child_sas.push(child_sa);
    }

    /// The registered CHILD_SAs
    pub fn child_sas(&self) -> &[ChildSa] {
        &self.child_sas
    }
}
