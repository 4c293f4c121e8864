//! CHILD_SA object and lifecycle
//!
//! A [`ChildSa`] represents one IPsec child security association from
//! allocation through kernel installation. It owns the negotiated SPIs
//! and CPIs, the narrowed traffic selectors, mode, protocol and security
//! label, and exposes the install/register/policy primitives backed by
//! the kernel IPsec engine.
//!
//! # Lifecycle
//!
//! ```text
//! CREATED --> INSTALLING --> INSTALLED
//!    |             |
//!    +--> RETRYING +--> DELETING
//! ```
//!
//! The outbound half has its own sub-state: during rekeying the outbound
//! SA is only *registered* and activated later, once the old SA's delete
//! arrives.
//!
//! # Ownership
//!
//! The creating task solely owns the CHILD_SA until it reaches
//! INSTALLED, at which point ownership transfers to the IKE_SA. A reqid
//! reference taken at construction is released exactly once on drop.

use crate::ipsec::config::ChildConfig;
use crate::ipsec::ikev2::constants::{IpcompTransform, IpsecMode, ProtocolId};
use crate::ipsec::ikev2::proposal::Proposal;
use crate::ipsec::ikev2::ts::{SecLabel, TrafficSelector};
use crate::ipsec::{Error, Result};
use ironwire_platform::{KernelIpsec, PolicyEntry, SaEntry};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_UNIQUE_ID: AtomicU32 = AtomicU32::new(1);

/// CHILD_SA lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// Allocated, negotiation in progress
    Created,
    /// Keys derived, kernel installation in progress
    Installing,
    /// Fully installed and registered with the IKE_SA
    Installed,
    /// Negotiation is being retried with another key exchange method
    Retrying,
    /// A delete for this SA is being exchanged
    Deleting,
}

/// State of the outbound half of a CHILD_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Not touched yet
    None,
    /// Handed to the kernel but not activated (rekey handover)
    Registered,
    /// Active
    Installed,
}

/// Per-negotiation overrides collected before the CHILD_SA exists
#[derive(Debug, Clone, Default)]
pub struct ChildSaParams {
    /// Reserved reqid (0 for dynamic)
    pub reqid: u32,
    /// Inbound mark
    pub mark_in: u32,
    /// Outbound mark
    pub mark_out: u32,
    /// Inbound interface ID override
    pub if_id_in: u32,
    /// Outbound interface ID override
    pub if_id_out: u32,
    /// Default inbound interface ID (from the IKE_SA)
    pub if_id_in_def: u32,
    /// Default outbound interface ID (from the IKE_SA)
    pub if_id_out_def: u32,
    /// UDP encapsulation (any NAT condition on the IKE_SA)
    pub encap: bool,
    /// Security label
    pub label: Option<SecLabel>,
}

/// An IPsec child security association
pub struct ChildSa {
    unique_id: u32,
    name: String,
    config: Arc<ChildConfig>,
    kernel: Arc<dyn KernelIpsec>,
    my_host: IpAddr,
    other_host: IpAddr,
    reqid: u32,
    static_reqid: bool,
    marks: (u32, u32),
    if_ids: (u32, u32),
    encap: bool,
    protocol: ProtocolId,
    my_spi: u32,
    other_spi: u32,
    my_cpi: u16,
    other_cpi: u16,
    ipcomp: IpcompTransform,
    mode: IpsecMode,
    proposal: Option<Proposal>,
    my_ts: Vec<TrafficSelector>,
    other_ts: Vec<TrafficSelector>,
    label: Option<SecLabel>,
    state: ChildSaState,
    outbound_state: OutboundState,
}

impl std::fmt::Debug for ChildSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSa")
            .field("unique_id", &self.unique_id)
            .field("name", &self.name)
            .field("reqid", &self.reqid)
            .field("my_spi", &self.my_spi)
            .field("other_spi", &self.other_spi)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("outbound_state", &self.outbound_state)
            .finish_non_exhaustive()
    }
}

impl ChildSa {
    /// Create a CHILD_SA from its configuration and per-negotiation data
    ///
    /// Takes a reqid reference if one is reserved; the reference is
    /// released when the CHILD_SA is dropped.
    pub fn new(
        my_host: IpAddr,
        other_host: IpAddr,
        config: Arc<ChildConfig>,
        params: &ChildSaParams,
        kernel: Arc<dyn KernelIpsec>,
    ) -> Self {
        let reqid = if params.reqid != 0 {
            params.reqid
        } else {
            config.reqid
        };
        let static_reqid = reqid != 0;
        if static_reqid {
            kernel.ref_reqid(reqid);
        }

        let if_id_in = if params.if_id_in != 0 {
            params.if_id_in
        } else {
            params.if_id_in_def
        };
        let if_id_out = if params.if_id_out != 0 {
            params.if_id_out
        } else {
            params.if_id_out_def
        };

        let label = params.label.clone().or_else(|| config.label.clone());

        ChildSa {
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            name: config.name.clone(),
            mode: config.get_mode(),
            config,
            kernel,
            my_host,
            other_host,
            reqid,
            static_reqid,
            marks: (params.mark_in, params.mark_out),
            if_ids: (if_id_in, if_id_out),
            encap: params.encap,
            protocol: ProtocolId::Esp,
            my_spi: 0,
            other_spi: 0,
            my_cpi: 0,
            other_cpi: 0,
            ipcomp: IpcompTransform::None,
            proposal: None,
            my_ts: Vec::new(),
            other_ts: Vec::new(),
            label,
            state: ChildSaState::Created,
            outbound_state: OutboundState::None,
        }
    }

    /// Process-unique id of this CHILD_SA
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Connection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this CHILD_SA was created from
    pub fn config(&self) -> &Arc<ChildConfig> {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChildSaState {
        self.state
    }

    /// Transition the lifecycle state
    pub fn set_state(&mut self, state: ChildSaState) {
        debug!(
            child = %self.name,
            unique_id = self.unique_id,
            from = ?self.state,
            to = ?state,
            "CHILD_SA state change"
        );
        self.state = state;
    }

    /// State of the outbound half
    pub fn outbound_state(&self) -> OutboundState {
        self.outbound_state
    }

    /// The SPI of the inbound (true) or outbound (false) SA
    pub fn spi(&self, inbound: bool) -> u32 {
        if inbound {
            self.my_spi
        } else {
            self.other_spi
        }
    }

    /// The mark of the inbound (true) or outbound (false) direction
    pub fn mark(&self, inbound: bool) -> u32 {
        if inbound {
            self.marks.0
        } else {
            self.marks.1
        }
    }

    /// The interface ID of the inbound (true) or outbound (false) direction
    pub fn if_id(&self, inbound: bool) -> u32 {
        if inbound {
            self.if_ids.0
        } else {
            self.if_ids.1
        }
    }

    /// The reqid grouping this SA with its policies
    pub fn reqid(&self) -> u32 {
        self.reqid
    }

    /// Whether the reqid was statically configured
    pub fn has_static_reqid(&self) -> bool {
        self.static_reqid
    }

    /// The security label, if any
    pub fn label(&self) -> Option<&SecLabel> {
        self.label.as_ref()
    }

    /// The encapsulation mode
    pub fn mode(&self) -> IpsecMode {
        self.mode
    }

    /// Set the encapsulation mode
    pub fn set_mode(&mut self, mode: IpsecMode) {
        self.mode = mode;
    }

    /// The IPsec protocol
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Set the IPsec protocol
    pub fn set_protocol(&mut self, protocol: ProtocolId) {
        self.protocol = protocol;
    }

    /// Set the IPComp transform and CPIs
    pub fn set_ipcomp(&mut self, ipcomp: IpcompTransform, my_cpi: u16, other_cpi: u16) {
        self.ipcomp = ipcomp;
        self.my_cpi = my_cpi;
        self.other_cpi = other_cpi;
    }

    /// The selected proposal
    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Set the selected proposal
    pub fn set_proposal(&mut self, proposal: Proposal) {
        self.proposal = Some(proposal);
    }

    /// The narrowed traffic selectors of one side
    pub fn ts(&self, local: bool) -> &[TrafficSelector] {
        if local {
            &self.my_ts
        } else {
            &self.other_ts
        }
    }

    /// Allocate the inbound SPI from the kernel, 0 on failure
    pub fn alloc_spi(&mut self, protocol: ProtocolId) -> u32 {
        self.protocol = protocol;
        self.my_spi = self.kernel.alloc_spi(protocol.ip_protocol());
        self.my_spi
    }

    /// Allocate a CPI for IPComp from the kernel, 0 on failure
    pub fn alloc_cpi(&mut self) -> u16 {
        self.my_cpi = self.kernel.alloc_cpi();
        self.my_cpi
    }

    /// Update the endpoint addresses and encapsulation flag
    ///
    /// The IKE endpoints may have moved since the negotiation started;
    /// called before any kernel state is configured.
    pub fn update(&mut self, my_host: IpAddr, other_host: IpAddr, encap: bool) {
        self.my_host = my_host;
        self.other_host = other_host;
        self.encap = encap;
    }

    /// Set the narrowed selector pair as this SA's policies
    pub fn set_policies(&mut self, my_ts: Vec<TrafficSelector>, other_ts: Vec<TrafficSelector>) {
        self.my_ts = my_ts;
        self.other_ts = other_ts;
    }

    fn sa_entry<'a>(
        &'a self,
        encr: &'a [u8],
        integ: &'a [u8],
        spi: u32,
        cpi: u16,
        inbound: bool,
        tfc_v3: bool,
    ) -> SaEntry<'a> {
        let (src, dst) = if inbound {
            (self.other_host, self.my_host)
        } else {
            (self.my_host, self.other_host)
        };
        SaEntry {
            protocol: self.protocol.ip_protocol(),
            spi,
            cpi,
            src,
            dst,
            encr_key: encr,
            integ_key: integ,
            mode: self.mode.kernel_code(),
            reqid: self.reqid,
            mark: self.mark(inbound),
            if_id: self.if_id(inbound),
            inbound,
            encap: self.encap,
            tfc_v3,
        }
    }

    /// Install one half of the SA pair into the kernel
    pub fn install(
        &mut self,
        encr: &[u8],
        integ: &[u8],
        spi: u32,
        cpi: u16,
        inbound: bool,
        tfc_v3: bool,
    ) -> Result<()> {
        let entry = self.sa_entry(encr, integ, spi, cpi, inbound, tfc_v3);
        self.kernel
            .install_sa(&entry)
            .map_err(|e| Error::Kernel(e.to_string()))?;
        if inbound {
            self.my_spi = spi;
            self.my_cpi = cpi;
        } else {
            self.other_spi = spi;
            self.other_cpi = cpi;
            self.outbound_state = OutboundState::Installed;
        }
        Ok(())
    }

    /// Register the outbound SA without activating it (rekey handover)
    pub fn register_outbound(
        &mut self,
        encr: &[u8],
        integ: &[u8],
        spi: u32,
        cpi: u16,
        tfc_v3: bool,
    ) -> Result<()> {
        let entry = self.sa_entry(encr, integ, spi, cpi, false, tfc_v3);
        self.kernel
            .register_outbound(&entry)
            .map_err(|e| Error::Kernel(e.to_string()))?;
        self.other_spi = spi;
        self.other_cpi = cpi;
        self.outbound_state = OutboundState::Registered;
        Ok(())
    }

    /// Install the flow policies for this SA pair
    pub fn install_policies(&self) -> Result<()> {
        let entry = PolicyEntry {
            reqid: self.reqid,
            mode: self.mode.kernel_code(),
            protocol: self.protocol.ip_protocol(),
            local: self.my_ts.iter().map(|ts| ts.to_flow()).collect(),
            remote: self.other_ts.iter().map(|ts| ts.to_flow()).collect(),
            marks: self.marks,
            if_ids: self.if_ids,
        };
        self.kernel
            .install_policies(&entry)
            .map_err(|e| Error::Kernel(e.to_string()))
    }

    /// Compare against another CHILD_SA for duplicate suppression
    ///
    /// Two CHILD_SAs are duplicates when they share the configuration,
    /// marks, interface IDs and labels; reqids only disambiguate when
    /// both are static.
    pub fn is_duplicate_of(&self, other: &ChildSa) -> bool {
        *self.config == *other.config
            && (!self.static_reqid || !other.static_reqid || self.reqid == other.reqid)
            && self.marks == other.marks
            && self.if_ids == other.if_ids
            && self.label == other.label
    }
}

impl Drop for ChildSa {
    fn drop(&mut self) {
        if self.static_reqid {
            self.kernel.release_reqid(self.reqid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::config::TsTemplate;
    use crate::ipsec::ikev2::proposal::{EncrTransformId, Transform};
    use ironwire_platform::MemoryKernel;

    fn config(reqid: u32) -> Arc<ChildConfig> {
        Arc::new(
            ChildConfig::builder("net-net")
                .with_proposal(
                    Proposal::new(1, ProtocolId::Esp)
                        .add_transform(Transform::encr(EncrTransformId::AesGcm128)),
                )
                .with_local_ts(TsTemplate::Dynamic)
                .with_remote_ts(TsTemplate::Dynamic)
                .with_reqid(reqid)
                .build()
                .unwrap(),
        )
    }

    fn child(kernel: Arc<MemoryKernel>, reqid: u32) -> ChildSa {
        ChildSa::new(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            config(reqid),
            &ChildSaParams::default(),
            kernel,
        )
    }

    #[test]
    fn test_unique_ids_increase() {
        let kernel = Arc::new(MemoryKernel::default());
        let a = child(kernel.clone(), 0);
        let b = child(kernel, 0);
        assert!(b.unique_id() > a.unique_id());
    }

    #[test]
    fn test_initial_state() {
        let kernel = Arc::new(MemoryKernel::default());
        let sa = child(kernel, 0);
        assert_eq!(sa.state(), ChildSaState::Created);
        assert_eq!(sa.outbound_state(), OutboundState::None);
        assert_eq!(sa.spi(true), 0);
        assert_eq!(sa.mode(), IpsecMode::Tunnel);
    }

    #[test]
    fn test_spi_allocation() {
        let kernel = Arc::new(MemoryKernel::default());
        let mut sa = child(kernel, 0);
        let spi = sa.alloc_spi(ProtocolId::Esp);
        assert_ne!(spi, 0);
        assert_eq!(sa.spi(true), spi);
        assert_eq!(sa.protocol(), ProtocolId::Esp);
    }

    #[test]
    fn test_reqid_referenced_and_released() {
        let kernel = Arc::new(MemoryKernel::default());
        {
            let sa = child(kernel.clone(), 42);
            assert_eq!(sa.reqid(), 42);
            assert!(sa.has_static_reqid());
            assert_eq!(kernel.reqid_refs(42), 1);
        }
        assert_eq!(kernel.reqid_refs(42), 0);
    }

    #[test]
    fn test_params_reqid_overrides_config() {
        let kernel = Arc::new(MemoryKernel::default());
        let params = ChildSaParams {
            reqid: 7,
            ..Default::default()
        };
        let sa = ChildSa::new(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            config(42),
            &params,
            kernel,
        );
        assert_eq!(sa.reqid(), 7);
    }

    #[test]
    fn test_if_id_defaults() {
        let kernel = Arc::new(MemoryKernel::default());
        let params = ChildSaParams {
            if_id_in: 5,
            if_id_in_def: 1,
            if_id_out_def: 2,
            ..Default::default()
        };
        let sa = ChildSa::new(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            config(0),
            &params,
            kernel,
        );
        assert_eq!(sa.if_id(true), 5);
        assert_eq!(sa.if_id(false), 2);
    }

    #[test]
    fn test_install_inbound_and_outbound() {
        let kernel = Arc::new(MemoryKernel::default());
        let mut sa = child(kernel.clone(), 0);
        sa.alloc_spi(ProtocolId::Esp);
        let my_spi = sa.spi(true);

        sa.install(&[0xAA; 16], &[], my_spi, 0, true, true).unwrap();
        sa.install(&[0xBB; 16], &[], 0x9999, 0, false, true).unwrap();

        assert_eq!(sa.spi(false), 0x9999);
        assert_eq!(sa.outbound_state(), OutboundState::Installed);

        let sas = kernel.installed_sas();
        assert_eq!(sas.len(), 2);
        assert!(sas[0].inbound);
        assert!(!sas[1].inbound);
    }

    #[test]
    fn test_register_outbound() {
        let kernel = Arc::new(MemoryKernel::default());
        let mut sa = child(kernel.clone(), 0);
        sa.register_outbound(&[0xCC; 16], &[], 0x7777, 0, true)
            .unwrap();
        assert_eq!(sa.outbound_state(), OutboundState::Registered);
        assert!(kernel.installed_sas()[0].registered_only);
    }

    #[test]
    fn test_install_failure_propagates() {
        let kernel = Arc::new(MemoryKernel::default());
        kernel.fail_sa_install(true);
        let mut sa = child(kernel, 0);
        let result = sa.install(&[0xAA; 16], &[], 1, 0, true, true);
        assert!(matches!(result, Err(Error::Kernel(_))));
        assert_eq!(sa.outbound_state(), OutboundState::None);
    }

    #[test]
    fn test_install_policies() {
        let kernel = Arc::new(MemoryKernel::default());
        let mut sa = child(kernel.clone(), 0);
        sa.set_policies(
            vec![TrafficSelector::subnet("10.1.0.0".parse().unwrap(), 16).unwrap()],
            vec![TrafficSelector::subnet("10.2.0.0".parse().unwrap(), 16).unwrap()],
        );
        sa.install_policies().unwrap();

        let policies = kernel.installed_policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].local.len(), 1);
        assert_eq!(policies[0].remote.len(), 1);
    }

    #[test]
    fn test_duplicate_detection() {
        let kernel = Arc::new(MemoryKernel::default());
        let a = child(kernel.clone(), 0);
        let b = child(kernel.clone(), 0);
        assert!(a.is_duplicate_of(&b));

        // Different marks break equality
        let params = ChildSaParams {
            mark_in: 1,
            ..Default::default()
        };
        let c = ChildSa::new(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            config(0),
            &params,
            kernel.clone(),
        );
        assert!(!a.is_duplicate_of(&c));

        // Static reqids must match when both are set
        let d = child(kernel.clone(), 9);
        let e = child(kernel.clone(), 10);
        assert!(!d.is_duplicate_of(&e));

        // A static and a dynamic reqid still compare equal
        let f = child(kernel, 0);
        assert!(d.is_duplicate_of(&f));
    }

    #[test]
    fn test_update_endpoints() {
        let kernel = Arc::new(MemoryKernel::default());
        let mut sa = child(kernel.clone(), 0);
        sa.update(
            "198.51.100.1".parse().unwrap(),
            "198.51.100.2".parse().unwrap(),
            true,
        );
        sa.install(&[0xAA; 16], &[], 1, 0, true, true).unwrap();
        assert!(kernel.installed_sas()[0].encap);
    }
}
