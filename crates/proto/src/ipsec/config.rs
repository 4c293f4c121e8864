//! CHILD_SA, peer and IKE configuration
//!
//! Immutable policy records consulted during CHILD_SA negotiation, plus
//! the strongswan.conf-style settings knobs that tune negotiation
//! behavior.

use crate::ipsec::ikev2::constants::{IpsecMode, KeMethod, TransformType};
use crate::ipsec::ikev2::proposal::{select_proposal, Proposal, SelectionFlags};
use crate::ipsec::ikev2::ts::{narrow_ts_lists, SecLabel, TrafficSelector};
use crate::ipsec::{Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Childless IKE_SA initiation policy (RFC 6023)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildlessPolicy {
    /// Never initiate or accept childless IKE_SAs
    Never,
    /// Accept childless initiation, include a CHILD_SA when initiating
    #[default]
    Allow,
    /// Prefer childless initiation; create CHILD_SAs separately
    Prefer,
    /// Require childless initiation
    Force,
}

/// How security labels are handled for a child configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecLabelMode {
    /// The configured label is proposed and must be returned verbatim
    #[default]
    Simple,
    /// Labels come from acquires; the configured label is only generic
    Selinux,
}

/// Option flags of a child configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChildOptions(u32);

impl ChildOptions {
    /// Accept transport mode for proxied (non-local) selectors
    pub const PROXY_MODE: u32 = 0x0001;
    /// Propose IPComp compression
    pub const IPCOMP: u32 = 0x0002;

    /// Create from raw bits
    pub fn new(bits: u32) -> Self {
        ChildOptions(bits)
    }

    /// Check whether an option is set
    pub fn has(self, option: u32) -> bool {
        self.0 & option != 0
    }
}

/// Traffic selector template of a child configuration
///
/// `Dynamic` expands to the negotiating host's addresses (IKE endpoint
/// or virtual IPs) at narrowing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsTemplate {
    /// One host selector per dynamic address
    Dynamic,
    /// A fixed selector from configuration
    Fixed(TrafficSelector),
}

/// Immutable CHILD_SA policy record
#[derive(Debug, Clone, PartialEq)]
pub struct ChildConfig {
    /// Connection name
    pub name: String,
    /// ESP/AH proposals, in preference order
    pub proposals: Vec<Proposal>,
    /// Requested encapsulation mode
    pub mode: IpsecMode,
    /// Local traffic selector templates
    pub local_ts: Vec<TsTemplate>,
    /// Remote traffic selector templates
    pub remote_ts: Vec<TsTemplate>,
    /// Close the CHILD_SA after this period without traffic
    pub inactivity: Option<Duration>,
    /// Static reqid (0 for dynamic allocation)
    pub reqid: u32,
    /// Configured security label
    pub label: Option<SecLabel>,
    /// Label handling mode
    pub label_mode: SecLabelMode,
    /// Option flags
    pub options: ChildOptions,
}

impl ChildConfig {
    /// Create a builder for a child configuration
    pub fn builder(name: impl Into<String>) -> ChildConfigBuilder {
        ChildConfigBuilder::new(name)
    }

    /// Requested encapsulation mode
    pub fn get_mode(&self) -> IpsecMode {
        self.mode
    }

    /// Check an option flag
    pub fn has_option(&self, option: u32) -> bool {
        self.options.has(option)
    }

    /// The preferred key exchange method (first KE transform of the
    /// first proposal), `NONE` without PFS
    pub fn preferred_ke_method(&self) -> KeMethod {
        self.proposals
            .first()
            .and_then(|p| p.get_algorithm(TransformType::Ke))
            .map(KeMethod)
            .unwrap_or(KeMethod::NONE)
    }

    /// Clone the configured proposals, stripping key exchange transforms
    /// when the exchange carries no KE payload
    pub fn get_proposals(&self, no_ke: bool) -> Vec<Proposal> {
        if no_ke {
            self.proposals
                .iter()
                .map(|p| p.without_ke_transforms())
                .collect()
        } else {
            self.proposals.clone()
        }
    }

    /// Select a proposal from the peer's offer
    pub fn select_proposal(
        &self,
        offered: &[Proposal],
        flags: SelectionFlags,
    ) -> Result<Proposal> {
        select_proposal(offered, &self.proposals, flags)
    }

    /// Resolve the selector templates against a set of dynamic hosts
    fn concrete_ts(&self, local: bool, hosts: &[IpAddr]) -> Vec<TrafficSelector> {
        let templates = if local {
            &self.local_ts
        } else {
            &self.remote_ts
        };
        let mut out = Vec::new();
        for template in templates {
            match template {
                TsTemplate::Dynamic => {
                    for host in hosts {
                        // An unspecified address stands for a pending
                        // virtual IP and expands to the full wildcard
                        out.push(if host.is_unspecified() {
                            if host.is_ipv4() {
                                TrafficSelector::ipv4_any()
                            } else {
                                TrafficSelector::ipv6_any()
                            }
                        } else {
                            TrafficSelector::host(*host)
                        });
                    }
                }
                TsTemplate::Fixed(ts) => out.push(ts.clone()),
            }
        }
        out
    }

    /// Derive the traffic selectors for one side
    ///
    /// With a supplied (peer) list, returns the narrowed intersection
    /// preserving the peer's preference order; without one, returns the
    /// resolved templates as the offer.
    pub fn get_traffic_selectors(
        &self,
        local: bool,
        supplied: Option<&[TrafficSelector]>,
        hosts: &[IpAddr],
    ) -> Vec<TrafficSelector> {
        let configured = self.concrete_ts(local, hosts);
        match supplied {
            Some(supplied) => narrow_ts_lists(supplied, &configured),
            None => configured,
        }
    }

    /// Select the security label consistent with the configuration
    ///
    /// Returns the label to use, or an error when the proposed labels
    /// cannot be accepted.
    pub fn select_label(&self, hints: &[SecLabel]) -> Result<Option<SecLabel>> {
        match (&self.label, hints.first()) {
            (None, None) => Ok(None),
            (None, Some(hint)) => Err(Error::LabelMismatch(format!(
                "peer proposed label '{}' but none is configured",
                hint
            ))),
            (Some(_), None) => Ok(None),
            (Some(configured), Some(hint)) => match self.label_mode {
                SecLabelMode::Simple => {
                    if hint == configured {
                        Ok(Some(hint.clone()))
                    } else {
                        Err(Error::LabelMismatch(format!(
                            "proposed label '{}' doesn't match configured '{}'",
                            hint, configured
                        )))
                    }
                }
                // Acquire-specific labels are accepted as long as any
                // label is configured
                SecLabelMode::Selinux => Ok(Some(hint.clone())),
            },
        }
    }
}

/// Builder for [`ChildConfig`]
pub struct ChildConfigBuilder {
    name: String,
    proposals: Vec<Proposal>,
    mode: IpsecMode,
    local_ts: Vec<TsTemplate>,
    remote_ts: Vec<TsTemplate>,
    inactivity: Option<Duration>,
    reqid: u32,
    label: Option<SecLabel>,
    label_mode: SecLabelMode,
    options: u32,
}

impl ChildConfigBuilder {
    /// Create new builder
    pub fn new(name: impl Into<String>) -> Self {
        ChildConfigBuilder {
            name: name.into(),
            proposals: Vec::new(),
            mode: IpsecMode::Tunnel,
            local_ts: Vec::new(),
            remote_ts: Vec::new(),
            inactivity: None,
            reqid: 0,
            label: None,
            label_mode: SecLabelMode::Simple,
            options: 0,
        }
    }

    /// Add a proposal
    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Set the encapsulation mode
    pub fn with_mode(mut self, mode: IpsecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a local traffic selector template
    pub fn with_local_ts(mut self, template: TsTemplate) -> Self {
        self.local_ts.push(template);
        self
    }

    /// Add a remote traffic selector template
    pub fn with_remote_ts(mut self, template: TsTemplate) -> Self {
        self.remote_ts.push(template);
        self
    }

    /// Set the inactivity timeout
    pub fn with_inactivity(mut self, timeout: Duration) -> Self {
        self.inactivity = Some(timeout);
        self
    }

    /// Set a static reqid
    pub fn with_reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Set the security label and mode
    pub fn with_label(mut self, label: SecLabel, mode: SecLabelMode) -> Self {
        self.label = Some(label);
        self.label_mode = mode;
        self
    }

    /// Set an option flag
    pub fn with_option(mut self, option: u32) -> Self {
        self.options |= option;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ChildConfig> {
        if self.proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one proposal required".into(),
            ));
        }
        if self.local_ts.is_empty() || self.remote_ts.is_empty() {
            return Err(Error::InvalidParameter(
                "Traffic selector templates required for both sides".into(),
            ));
        }
        Ok(ChildConfig {
            name: self.name,
            proposals: self.proposals,
            mode: self.mode,
            local_ts: self.local_ts,
            remote_ts: self.remote_ts,
            inactivity: self.inactivity,
            reqid: self.reqid,
            label: self.label,
            label_mode: self.label_mode,
            options: ChildOptions::new(self.options),
        })
    }
}

/// Peer configuration: the child configurations negotiable under one
/// IKE_SA, plus the virtual IPs requested from the peer
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Child configurations, in preference order
    pub child_cfgs: Vec<Arc<ChildConfig>>,
    /// Virtual IPs we request (initiator side)
    pub virtual_ips: Vec<IpAddr>,
}

impl PeerConfig {
    /// Create a peer configuration from child configurations
    pub fn new(child_cfgs: Vec<Arc<ChildConfig>>) -> Self {
        PeerConfig {
            child_cfgs,
            virtual_ips: Vec::new(),
        }
    }

    /// Request a virtual IP of the given family
    pub fn with_virtual_ip(mut self, vip: IpAddr) -> Self {
        self.virtual_ips.push(vip);
        self
    }

    /// Select the child configuration matching received selectors
    ///
    /// `my_ts`/`other_ts` are the selectors from the peer's view of us
    /// and of itself; both narrowed lists must be non-empty, and any
    /// proposed labels must be selectable.
    pub fn select_child_cfg(
        &self,
        my_ts: &[TrafficSelector],
        other_ts: &[TrafficSelector],
        my_hosts: &[IpAddr],
        other_hosts: &[IpAddr],
        labels: &[SecLabel],
    ) -> Option<Arc<ChildConfig>> {
        self.child_cfgs
            .iter()
            .find(|cfg| {
                let local = cfg.get_traffic_selectors(true, Some(my_ts), my_hosts);
                let remote = cfg.get_traffic_selectors(false, Some(other_ts), other_hosts);
                !local.is_empty() && !remote.is_empty() && cfg.select_label(labels).is_ok()
            })
            .cloned()
    }
}

/// IKE_SA level configuration observed by CHILD_SA tasks
#[derive(Debug, Clone, Default)]
pub struct IkeConfig {
    /// Childless initiation policy
    pub childless: ChildlessPolicy,
}

/// Tunable negotiation settings
///
/// Mirrors the daemon-wide configuration file section; defaults match
/// common deployments.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Accept proposals containing private-use algorithm identifiers
    /// from unknown peers
    pub accept_private_algs: bool,
    /// Prefer our configured proposal order over the peer's
    pub prefer_configured_proposals: bool,
    /// Close the IKE_SA if its first CHILD_SA fails
    pub close_ike_on_child_failure: bool,
    /// Close the IKE_SA when an inactivity timeout hits
    pub inactivity_close_ike: bool,
    /// Base delay before retrying after TEMPORARY_FAILURE
    pub retry_interval: Duration,
    /// Random amount subtracted from the retry delay
    pub retry_jitter: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            accept_private_algs: false,
            prefer_configured_proposals: true,
            close_ike_on_child_failure: false,
            inactivity_close_ike: false,
            retry_interval: Duration::from_secs(15),
            retry_jitter: Duration::from_secs(10),
        }
    }
}
