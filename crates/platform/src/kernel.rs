//! Kernel IPsec engine interface
//!
//! Abstracts the platform's IPsec engine (XFRM, PF_KEY, a userspace data
//! plane, ...) behind a narrow trait. The protocol crates hand fully
//! negotiated SA parameters to this interface; everything above it stays
//! platform independent.
//!
//! # Responsibilities
//!
//! - Allocate Security Parameter Indexes (SPIs) and Compression Parameter
//!   Indexes (CPIs) from the engine's namespace
//! - Reference-count request IDs (reqids) that group SA pairs under a
//!   shared policy
//! - Install inbound/outbound SAs and flow policies
//! - Advertise optional engine capabilities as feature bits
//!
//! The [`MemoryKernel`] reference engine implements the trait entirely in
//! memory. Integration tests run against it, and deployments without kernel
//! support can use it as a recording stub.

use crate::{IronwireError, IronwireResult};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::debug;

/// Optional capabilities of a kernel IPsec engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelFeatures(u32);

impl KernelFeatures {
    /// Engine supports ESPv3 style Traffic Flow Confidentiality padding
    pub const ESP_V3_TFC: u32 = 0x0001;

    /// Create an empty feature set
    pub fn empty() -> Self {
        KernelFeatures(0)
    }

    /// Create a feature set from raw bits
    pub fn new(bits: u32) -> Self {
        KernelFeatures(bits)
    }

    /// Check whether a feature bit is set
    pub fn has(self, feature: u32) -> bool {
        self.0 & feature != 0
    }

    /// Get raw bits
    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Flat traffic selector as passed to the engine
///
/// The protocol layer converts its richer selector type into this form
/// before policies are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSelector {
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
}

/// Parameters for a single SA installation
#[derive(Debug, Clone)]
pub struct SaEntry<'a> {
    /// IPsec protocol number (50 for ESP, 51 for AH)
    pub protocol: u8,
    /// Security Parameter Index
    pub spi: u32,
    /// Compression Parameter Index (0 when IPComp is off)
    pub cpi: u16,
    /// Source address of the SA
    pub src: IpAddr,
    /// Destination address of the SA
    pub dst: IpAddr,
    /// Encryption key
    pub encr_key: &'a [u8],
    /// Integrity key (empty for AEAD ciphers)
    pub integ_key: &'a [u8],
    /// Engine mode code (1 = transport, 2 = tunnel, 4 = BEET)
    pub mode: u8,
    /// Request ID grouping this SA with its policies
    pub reqid: u32,
    /// Netfilter-style mark
    pub mark: u32,
    /// XFRM interface ID
    pub if_id: u32,
    /// Whether this is the inbound SA
    pub inbound: bool,
    /// UDP encapsulation (NAT traversal)
    pub encap: bool,
    /// Use ESPv3 TFC padding if available
    pub tfc_v3: bool,
}

/// Parameters for a policy installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Request ID the policies refer to
    pub reqid: u32,
    /// Engine mode code (1 = transport, 2 = tunnel, 4 = BEET)
    pub mode: u8,
    /// IPsec protocol number (50 for ESP, 51 for AH)
    pub protocol: u8,
    /// Local side selectors
    pub local: Vec<FlowSelector>,
    /// Remote side selectors
    pub remote: Vec<FlowSelector>,
    /// Netfilter-style marks (in, out)
    pub marks: (u32, u32),
    /// XFRM interface IDs (in, out)
    pub if_ids: (u32, u32),
}

/// Kernel IPsec engine interface
///
/// All calls are bounded, synchronous operations; implementations must be
/// safe to share across negotiation workers.
pub trait KernelIpsec: Send + Sync {
    /// Allocate an SPI for the given IPsec protocol, 0 on failure
    fn alloc_spi(&self, protocol: u8) -> u32;

    /// Allocate a CPI for IPComp, 0 on failure
    fn alloc_cpi(&self) -> u16;

    /// Take a reference on a reqid, false if the reqid cannot be reserved
    fn ref_reqid(&self, reqid: u32) -> bool;

    /// Drop a reference on a reqid, false if it was not referenced
    fn release_reqid(&self, reqid: u32) -> bool;

    /// Install an SA into the engine
    fn install_sa(&self, entry: &SaEntry<'_>) -> IronwireResult<()>;

    /// Register an outbound SA without activating it (rekey handover)
    fn register_outbound(&self, entry: &SaEntry<'_>) -> IronwireResult<()>;

    /// Install the flow policies for an SA pair
    fn install_policies(&self, entry: &PolicyEntry) -> IronwireResult<()>;

    /// Capabilities of this engine
    fn features(&self) -> KernelFeatures;
}

/// Record of an SA handed to [`MemoryKernel`]
///
/// Keys are copied so tests can assert the mirror-image property of the
/// derived keying material.
#[derive(Debug, Clone)]
pub struct InstalledSa {
    /// IPsec protocol number
    pub protocol: u8,
    /// Security Parameter Index
    pub spi: u32,
    /// Compression Parameter Index
    pub cpi: u16,
    /// Encryption key
    pub encr_key: Vec<u8>,
    /// Integrity key
    pub integ_key: Vec<u8>,
    /// Engine mode code
    pub mode: u8,
    /// Whether this is the inbound SA
    pub inbound: bool,
    /// Whether the SA was registered but not activated
    pub registered_only: bool,
    /// UDP encapsulation flag
    pub encap: bool,
}

#[derive(Debug, Default)]
struct MemoryKernelState {
    next_spi: u32,
    next_cpi: u16,
    reqids: HashMap<u32, u32>,
    sas: Vec<InstalledSa>,
    policies: Vec<PolicyEntry>,
    fail_spi_alloc: bool,
    fail_cpi_alloc: bool,
    fail_sa_install: bool,
    fail_policy_install: bool,
}

/// In-memory kernel IPsec engine
///
/// Allocates SPIs/CPIs from counters, reference-counts reqids and records
/// every install so callers can inspect what reached the engine.
#[derive(Debug)]
pub struct MemoryKernel {
    features: KernelFeatures,
    state: Mutex<MemoryKernelState>,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new(KernelFeatures::new(KernelFeatures::ESP_V3_TFC))
    }
}

impl MemoryKernel {
    /// Create an engine advertising the given features
    pub fn new(features: KernelFeatures) -> Self {
        MemoryKernel {
            features,
            state: Mutex::new(MemoryKernelState {
                next_spi: 0xc000_0000,
                next_cpi: 0x4000,
                ..Default::default()
            }),
        }
    }

    /// Make subsequent SPI allocations fail
    pub fn fail_spi_alloc(&self, fail: bool) {
        self.state.lock().unwrap().fail_spi_alloc = fail;
    }

    /// Make subsequent CPI allocations fail
    pub fn fail_cpi_alloc(&self, fail: bool) {
        self.state.lock().unwrap().fail_cpi_alloc = fail;
    }

    /// Make subsequent SA installs fail
    pub fn fail_sa_install(&self, fail: bool) {
        self.state.lock().unwrap().fail_sa_install = fail;
    }

    /// Make subsequent policy installs fail
    pub fn fail_policy_install(&self, fail: bool) {
        self.state.lock().unwrap().fail_policy_install = fail;
    }

    /// Snapshot of all SAs handed to the engine
    pub fn installed_sas(&self) -> Vec<InstalledSa> {
        self.state.lock().unwrap().sas.clone()
    }

    /// Snapshot of all policies handed to the engine
    pub fn installed_policies(&self) -> Vec<PolicyEntry> {
        self.state.lock().unwrap().policies.clone()
    }

    /// Current reference count of a reqid
    pub fn reqid_refs(&self, reqid: u32) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .reqids
            .get(&reqid)
            .unwrap_or(&0)
    }
}

impl KernelIpsec for MemoryKernel {
    fn alloc_spi(&self, protocol: u8) -> u32 {
        let mut state = self.state.lock().unwrap();
        if state.fail_spi_alloc {
            return 0;
        }
        state.next_spi += 1;
        debug!(protocol, spi = state.next_spi, "allocated SPI");
        state.next_spi
    }

    fn alloc_cpi(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        if state.fail_cpi_alloc {
            return 0;
        }
        state.next_cpi += 1;
        state.next_cpi
    }

    fn ref_reqid(&self, reqid: u32) -> bool {
        if reqid == 0 {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        *state.reqids.entry(reqid).or_insert(0) += 1;
        true
    }

    fn release_reqid(&self, reqid: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.reqids.get_mut(&reqid) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                true
            }
            Some(_) => {
                state.reqids.remove(&reqid);
                true
            }
            None => false,
        }
    }

    fn install_sa(&self, entry: &SaEntry<'_>) -> IronwireResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sa_install {
            return Err(IronwireError::Kernel("SA install rejected".into()));
        }
        debug!(
            spi = format_args!("{:#010x}", entry.spi),
            inbound = entry.inbound,
            "installed SA"
        );
        state.sas.push(InstalledSa {
            protocol: entry.protocol,
            spi: entry.spi,
            cpi: entry.cpi,
            encr_key: entry.encr_key.to_vec(),
            integ_key: entry.integ_key.to_vec(),
            mode: entry.mode,
            inbound: entry.inbound,
            registered_only: false,
            encap: entry.encap,
        });
        Ok(())
    }

    fn register_outbound(&self, entry: &SaEntry<'_>) -> IronwireResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sa_install {
            return Err(IronwireError::Kernel("SA registration rejected".into()));
        }
        state.sas.push(InstalledSa {
            protocol: entry.protocol,
            spi: entry.spi,
            cpi: entry.cpi,
            encr_key: entry.encr_key.to_vec(),
            integ_key: entry.integ_key.to_vec(),
            mode: entry.mode,
            inbound: false,
            registered_only: true,
            encap: entry.encap,
        });
        Ok(())
    }

    fn install_policies(&self, entry: &PolicyEntry) -> IronwireResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_policy_install {
            return Err(IronwireError::Kernel("policy install rejected".into()));
        }
        state.policies.push(entry.clone());
        Ok(())
    }

    fn features(&self) -> KernelFeatures {
        self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> FlowSelector {
        FlowSelector {
            protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: "10.0.0.0".parse().unwrap(),
            end_addr: "10.0.0.255".parse().unwrap(),
        }
    }

    #[test]
    fn test_spi_allocation() {
        let kernel = MemoryKernel::default();
        let spi1 = kernel.alloc_spi(50);
        let spi2 = kernel.alloc_spi(50);
        assert_ne!(spi1, 0);
        assert_ne!(spi2, 0);
        assert_ne!(spi1, spi2);
    }

    #[test]
    fn test_spi_allocation_failure() {
        let kernel = MemoryKernel::default();
        kernel.fail_spi_alloc(true);
        assert_eq!(kernel.alloc_spi(50), 0);
    }

    #[test]
    fn test_cpi_allocation() {
        let kernel = MemoryKernel::default();
        assert_ne!(kernel.alloc_cpi(), 0);
        kernel.fail_cpi_alloc(true);
        assert_eq!(kernel.alloc_cpi(), 0);
    }

    #[test]
    fn test_reqid_refcounting() {
        let kernel = MemoryKernel::default();

        assert!(!kernel.ref_reqid(0));

        assert!(kernel.ref_reqid(7));
        assert!(kernel.ref_reqid(7));
        assert_eq!(kernel.reqid_refs(7), 2);

        assert!(kernel.release_reqid(7));
        assert_eq!(kernel.reqid_refs(7), 1);
        assert!(kernel.release_reqid(7));
        assert_eq!(kernel.reqid_refs(7), 0);

        assert!(!kernel.release_reqid(7));
    }

    #[test]
    fn test_sa_install_recording() {
        let kernel = MemoryKernel::default();
        let entry = SaEntry {
            protocol: 50,
            spi: 0x1234,
            cpi: 0,
            src: "192.0.2.1".parse().unwrap(),
            dst: "192.0.2.2".parse().unwrap(),
            encr_key: &[0xAA; 16],
            integ_key: &[],
            mode: 2,
            reqid: 1,
            mark: 0,
            if_id: 0,
            inbound: true,
            encap: false,
            tfc_v3: true,
        };

        kernel.install_sa(&entry).unwrap();
        let sas = kernel.installed_sas();
        assert_eq!(sas.len(), 1);
        assert_eq!(sas[0].spi, 0x1234);
        assert!(sas[0].inbound);
        assert!(!sas[0].registered_only);

        kernel.register_outbound(&entry).unwrap();
        let sas = kernel.installed_sas();
        assert!(sas[1].registered_only);
    }

    #[test]
    fn test_install_failure() {
        let kernel = MemoryKernel::default();
        kernel.fail_sa_install(true);
        let entry = SaEntry {
            protocol: 50,
            spi: 1,
            cpi: 0,
            src: "192.0.2.1".parse().unwrap(),
            dst: "192.0.2.2".parse().unwrap(),
            encr_key: &[],
            integ_key: &[],
            mode: 2,
            reqid: 0,
            mark: 0,
            if_id: 0,
            inbound: true,
            encap: false,
            tfc_v3: false,
        };
        assert!(kernel.install_sa(&entry).is_err());
    }

    #[test]
    fn test_policy_recording() {
        let kernel = MemoryKernel::default();
        let entry = PolicyEntry {
            reqid: 1,
            mode: 2,
            protocol: 50,
            local: vec![selector()],
            remote: vec![selector()],
            marks: (0, 0),
            if_ids: (0, 0),
        };
        kernel.install_policies(&entry).unwrap();
        assert_eq!(kernel.installed_policies(), vec![entry]);
    }

    #[test]
    fn test_features() {
        let kernel = MemoryKernel::default();
        assert!(kernel.features().has(KernelFeatures::ESP_V3_TFC));

        let kernel = MemoryKernel::new(KernelFeatures::empty());
        assert!(!kernel.features().has(KernelFeatures::ESP_V3_TFC));
    }
}
