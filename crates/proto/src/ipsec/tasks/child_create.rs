//! CHILD_SA creation task
//!
//! Drives one CHILD_SA negotiation from proposal exchange through kernel
//! installation (RFC 7296 Sections 1.3 and 2.17, RFC 9242, RFC 9370).
//! A task runs as initiator (built with a child configuration) or as
//! responder (built without one; the configuration is selected from the
//! peer configuration once the request arrives).
//!
//! # Rounds
//!
//! ```text
//! IKE_SA_INIT      nonce piggyback only
//! IKE_AUTH         first CHILD_SA alongside authentication (no KE payload)
//! CREATE_CHILD_SA  stand-alone creation, optional PFS
//! IKE_FOLLOWUP_KE  one round per additional key exchange
//! INFORMATIONAL    DELETE for a failed or aborted negotiation
//! ```
//!
//! Each round is a pure build or process step over the task state; the
//! IKE engine owns dispatch and retransmission. The task owns the
//! CHILD_SA under construction until it is installed, then hands it to
//! the IKE_SA.

use crate::ipsec::bus::{Alert, NarrowPhase};
use crate::ipsec::child_sa::{ChildSa, ChildSaParams, ChildSaState};
use crate::ipsec::config::{ChildConfig, ChildOptions, ChildlessPolicy, SecLabelMode};
use crate::ipsec::ike_sa::{Condition, Extension, IkeSa, IkeSaState};
use crate::ipsec::ikev2::constants::{
    ExchangeType, IpcompTransform, IpsecMode, KeMethod, NotifyType, ProtocolId, TransformType,
};
use crate::ipsec::ikev2::ke::{KePlan, KeyExchange};
use crate::ipsec::ikev2::message::Message;
use crate::ipsec::ikev2::payload::{
    DeletePayload, KePayload, NoncePayload, NotifyPayload, Payload, SaPayload, TsPayload,
};
use crate::ipsec::ikev2::proposal::{Proposal, SelectionFlags};
use crate::ipsec::ikev2::ts::{
    substitute_host_address, ts_list_is_host, SecLabel, TrafficSelector,
};
use crate::ipsec::logging;
use crate::ipsec::scheduler::{ChildCreateBlueprint, Job};
use crate::ipsec::tasks::{TaskContext, TaskStatus};
use ironwire_platform::KernelFeatures;
use rand::{Rng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Initial link token emitted by the responder in the first multi-KE round
const INITIAL_LINK_TOKEN: u8 = 0x42;

/// Delay before the IKE_SA delete scheduled on first-round child failure,
/// letting the IKE_AUTH response drain first
const CLOSE_IKE_DELAY: Duration = Duration::from_millis(100);

/// Which build handler runs on the next round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    /// Regular request/response building
    Normal,
    /// Only IKE_FOLLOWUP_KE payloads remain
    MultiKe,
    /// Emit an INFORMATIONAL DELETE for the failed SA
    Delete,
    /// Nothing left to send in this exchange
    NeedMoreOnly,
}

/// Which process handler runs on the next round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    /// Regular request/response processing
    Normal,
    /// Only IKE_FOLLOWUP_KE payloads expected
    MultiKe,
    /// Nothing left to process in this exchange
    NeedMoreOnly,
}

/// Outcome of the install step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallOutcome {
    /// SAs and policies are in the kernel
    Installed,
    /// The post hook rejected the selectors or policies failed
    TsRejected,
    /// SA installation failed
    Failed,
}

/// Continue-or-divert result of the childless checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Childless {
    /// Proceed with the CHILD_SA
    Continue,
    /// Defer creation until after the IKE_SA is established
    Defer,
    /// The policy mismatch is fatal to the IKE_SA
    Fatal,
}

/// The CHILD_SA creation task
pub struct ChildCreate {
    ctx: Arc<TaskContext>,
    initiator: bool,
    rekey: bool,
    retry: bool,
    aborted: bool,
    established: bool,

    config: Option<Arc<ChildConfig>>,
    packet_tsi: Option<TrafficSelector>,
    packet_tsr: Option<TrafficSelector>,

    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,

    proposals: Vec<Proposal>,
    proposal: Option<Proposal>,
    tsi: Vec<TrafficSelector>,
    tsr: Vec<TrafficSelector>,
    labels_i: Vec<SecLabel>,
    labels_r: Vec<SecLabel>,

    plan: KePlan,
    ke_method: KeMethod,
    ke: Option<Box<dyn KeyExchange>>,
    kes: Vec<Box<dyn KeyExchange>>,
    ke_failed: bool,
    link: Option<Vec<u8>>,

    mode: IpsecMode,
    tfcv3: bool,
    ipcomp: IpcompTransform,
    ipcomp_received: IpcompTransform,
    proto: ProtocolId,
    my_spi: u32,
    other_spi: u32,
    my_cpi: u16,
    other_cpi: u16,

    child: ChildSaParams,
    child_sa: Option<ChildSa>,

    build_state: BuildState,
    process_state: ProcessState,
}

impl ChildCreate {
    /// Create an initiating task from a child configuration
    ///
    /// `packet_tsi`/`packet_tsr` carry the selectors of a triggering
    /// packet, proposed with highest preference.
    pub fn new_initiator(
        ctx: Arc<TaskContext>,
        config: Arc<ChildConfig>,
        rekey: bool,
        packet_tsi: Option<TrafficSelector>,
        packet_tsr: Option<TrafficSelector>,
    ) -> Self {
        Self::new(ctx, Some(config), true, rekey, packet_tsi, packet_tsr)
    }

    /// Create a responding task; the configuration is selected from the
    /// peer configuration when the request arrives
    pub fn new_responder(ctx: Arc<TaskContext>) -> Self {
        Self::new(ctx, None, false, false, None, None)
    }

    fn new(
        ctx: Arc<TaskContext>,
        config: Option<Arc<ChildConfig>>,
        initiator: bool,
        rekey: bool,
        packet_tsi: Option<TrafficSelector>,
        packet_tsr: Option<TrafficSelector>,
    ) -> Self {
        ChildCreate {
            ctx,
            initiator,
            rekey,
            retry: false,
            aborted: false,
            established: false,
            config,
            packet_tsi,
            packet_tsr,
            my_nonce: Vec::new(),
            other_nonce: Vec::new(),
            proposals: Vec::new(),
            proposal: None,
            tsi: Vec::new(),
            tsr: Vec::new(),
            labels_i: Vec::new(),
            labels_r: Vec::new(),
            plan: KePlan::default(),
            ke_method: KeMethod::NONE,
            ke: None,
            kes: Vec::new(),
            ke_failed: false,
            link: None,
            mode: IpsecMode::Tunnel,
            tfcv3: true,
            ipcomp: IpcompTransform::None,
            ipcomp_received: IpcompTransform::None,
            proto: ProtocolId::Esp,
            my_spi: 0,
            other_spi: 0,
            my_cpi: 0,
            other_cpi: 0,
            child: ChildSaParams::default(),
            child_sa: None,
            build_state: BuildState::Normal,
            process_state: ProcessState::Normal,
        }
    }

    // --- configuration sinks, valid before the first build ---

    /// Reserve a specific reqid for the CHILD_SA
    ///
    /// A reservation failure is silently ignored; any previously
    /// reserved reqid is released.
    pub fn use_reqid(&mut self, reqid: u32) {
        let existing = self.child.reqid;
        if reqid == 0 || self.ctx.kernel.ref_reqid(reqid) {
            self.child.reqid = reqid;
            if existing != 0 {
                self.ctx.kernel.release_reqid(existing);
            }
        }
    }

    /// Override the default marks
    pub fn use_marks(&mut self, mark_in: u32, mark_out: u32) {
        self.child.mark_in = mark_in;
        self.child.mark_out = mark_out;
    }

    /// Override the default interface IDs
    pub fn use_if_ids(&mut self, if_id_in: u32, if_id_out: u32) {
        self.child.if_id_in = if_id_in;
        self.child.if_id_out = if_id_out;
    }

    /// Override the security label (from an acquire)
    pub fn use_label(&mut self, label: Option<&SecLabel>) {
        self.child.label = label.cloned();
    }

    /// Force the primary key exchange method (INVALID_KE_PAYLOAD retry)
    pub fn use_ke_method(&mut self, method: KeMethod) {
        self.ke_method = method;
    }

    /// Install the child configuration (responder, after selection)
    pub fn set_config(&mut self, config: Arc<ChildConfig>) {
        self.config = Some(config);
    }

    /// Abort the task; the next round deletes any allocated SPIs
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    // --- accessors ---

    /// The CHILD_SA under construction, if any
    pub fn get_child(&self) -> Option<&ChildSa> {
        self.child_sa.as_ref()
    }

    /// The peer's SPI once negotiated
    pub fn get_other_spi(&self) -> u32 {
        self.other_spi
    }

    /// Whether the CHILD_SA was installed and handed over
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// The configuration this task initiates with
    pub fn get_config(&self) -> Option<&Arc<ChildConfig>> {
        if self.initiator {
            self.config.as_ref()
        } else {
            None
        }
    }

    /// The lexicographically lower of the two nonces
    ///
    /// Compared over the shorter nonce's length; an equal prefix counts
    /// as ours being lower. Used to resolve rekey collisions.
    pub fn get_lower_nonce(&self) -> &[u8] {
        let len = self.my_nonce.len().min(self.other_nonce.len());
        if self.my_nonce[..len] <= self.other_nonce[..len] {
            &self.my_nonce
        } else {
            &self.other_nonce
        }
    }

    // --- round entry points ---

    /// Compose the next outbound message
    pub fn build(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        if self.initiator {
            match self.build_state {
                BuildState::Normal => self.build_i(ike_sa, message),
                BuildState::MultiKe => self.build_i_multi_ke(message),
                BuildState::Delete => self.build_i_delete(message),
                BuildState::NeedMoreOnly => TaskStatus::NeedMore,
            }
        } else {
            match self.build_state {
                BuildState::Normal => self.build_r(ike_sa, message),
                BuildState::MultiKe => self.build_r_multi_ke(ike_sa, message),
                _ => TaskStatus::NeedMore,
            }
        }
    }

    /// Process an inbound message
    pub fn process(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        if self.initiator {
            match self.process_state {
                ProcessState::Normal => self.process_i(ike_sa, message),
                ProcessState::MultiKe => self.process_i_multi_ke(ike_sa, message),
                ProcessState::NeedMoreOnly => TaskStatus::NeedMore,
            }
        } else {
            match self.process_state {
                ProcessState::Normal => self.process_r(ike_sa, message),
                ProcessState::MultiKe => self.process_r_multi_ke(message),
                ProcessState::NeedMoreOnly => TaskStatus::NeedMore,
            }
        }
    }

    // --- helpers ---

    fn settings(&self) -> &crate::ipsec::config::Settings {
        &self.ctx.settings
    }

    fn generate_nonce(&mut self, ike_sa: &IkeSa) {
        let mut nonce = vec![0u8; ike_sa.keymat().nonce_size()];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.my_nonce = nonce;
    }

    fn get_nonce(message: &Message) -> Option<Vec<u8>> {
        message.nonce_payload().map(|p| p.nonce.clone())
    }

    /// Only the generic configured label is available (SELinux mode,
    /// no acquire-specific label)
    fn generic_label_only(&self) -> bool {
        self.config.as_ref().is_some_and(|cfg| {
            cfg.label.is_some()
                && self.child.label.is_none()
                && cfg.label_mode == SecLabelMode::Selinux
        })
    }

    /// Assign our SPI to the candidate proposals and promote the
    /// selected key exchange method; proposals lacking it move to the
    /// back. False if no proposal offers the method.
    fn update_and_check_proposals(&mut self) -> bool {
        let mut with_method = Vec::new();
        let mut without_method = Vec::new();
        let mut found = false;

        for mut proposal in std::mem::take(&mut self.proposals) {
            proposal.set_spi(self.my_spi);
            if self.ke_method.is_none() {
                with_method.push(proposal);
            } else if proposal.promote_transform(TransformType::Ke, self.ke_method.to_u16()) {
                found = true;
                with_method.push(proposal);
            } else {
                without_method.push(proposal);
            }
        }
        with_method.extend(without_method);
        self.proposals = with_method;

        self.ke_method.is_none() || found
    }

    fn select_proposal(&mut self, no_ke: bool, ike_sa: &IkeSa) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if self.proposals.is_empty() {
            warn!("SA payload missing in message");
            return false;
        }

        let flags = SelectionFlags {
            skip_ke: no_ke,
            skip_private: !ike_sa.supports_extension(Extension::STRONGSWAN)
                && !self.settings().accept_private_algs,
            prefer_supplied: !self.settings().prefer_configured_proposals,
        };
        match config.select_proposal(&self.proposals, flags) {
            Ok(proposal) => {
                self.proposal = Some(proposal);
                true
            }
            Err(_) => {
                warn!("no acceptable proposal found");
                self.ctx.bus.alert(Alert::ProposalMismatchChild);
                false
            }
        }
    }

    fn process_ke_payload(&mut self, payload: &KePayload) {
        let received = payload.method;

        // The proposal is selected after processing the KE payload, so
        // an expected method only exists for additional exchanges.
        if let Some((_, expected)) = self.plan.next_pending() {
            if expected != received {
                warn!(
                    received = %received,
                    expected = %expected,
                    "key exchange method in received payload doesn't match negotiated"
                );
                self.ke_failed = true;
                return;
            }
        }

        self.ke_method = received;

        if !self.initiator {
            self.ke = self.ctx.ke_provider.create(received, false);
            if self.ke.is_none() {
                warn!(method = %received, "key exchange method not supported");
            }
        } else if let Some(ke) = &self.ke {
            if ke.method() != received {
                warn!(
                    received = %received,
                    ours = %ke.method(),
                    "key exchange method in received payload doesn't match"
                );
                self.ke_failed = true;
            }
        }

        if !self.ke_failed {
            if let Some(ke) = &mut self.ke {
                if let Err(e) = ke.set_public_key(&payload.key_data) {
                    warn!(error = %e, "applying key exchange public key failed");
                    self.ke_failed = true;
                }
            }
        }
    }

    /// Validate the negotiated KE method against the selected proposal
    ///
    /// `Err(alg)` reports the method the proposal expects instead. A
    /// proposal without any key exchange clears the method and forgives
    /// earlier KE errors.
    fn check_ke_method(&mut self) -> Result<(), KeMethod> {
        let proposal = self.proposal.as_ref().expect("proposal selected");
        if !proposal.has_transform(TransformType::Ke, self.ke_method.to_u16()) {
            if let Some(alg) = proposal.get_algorithm(TransformType::Ke) {
                return Err(KeMethod(alg));
            }
            debug!("ignoring KE payload, agreed on a non-PFS proposal");
            self.ke = None;
            self.ke_method = KeMethod::NONE;
            self.ke_failed = false;
        }
        Ok(())
    }

    fn determine_key_exchanges(&mut self) -> bool {
        let proposal = self.proposal.as_ref().expect("proposal selected");
        match KePlan::from_proposal(proposal) {
            Ok(plan) => {
                self.plan = plan;
                true
            }
            Err(e) => {
                warn!(error = %e, "rejecting proposal with malformed key exchanges");
                false
            }
        }
    }

    fn select_label(&mut self) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let li = match config.select_label(&self.labels_i) {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, "security label in TSi unacceptable");
                return false;
            }
        };
        let lr = match config.select_label(&self.labels_r) {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, "security label in TSr unacceptable");
                return false;
            }
        };

        if let Some(li) = li {
            if Some(&li) != lr.as_ref() {
                warn!("security labels in TSi and TSr don't match");
                return false;
            }
            match &self.child.label {
                None => self.child.label = Some(li),
                Some(existing) if *existing != li => {
                    warn!(
                        returned = %li,
                        proposed = %existing,
                        "returned security label doesn't match proposed"
                    );
                    return false;
                }
                Some(_) => {}
            }
        }
        if let Some(label) = &self.child.label {
            debug!(label = %label, "selected security label");
        }
        true
    }

    fn narrow_ts(
        &self,
        local: bool,
        supplied: &[TrafficSelector],
        ike_sa: &IkeSa,
    ) -> Vec<TrafficSelector> {
        let config = self.config.as_ref().expect("config selected");
        let cond = if local {
            Condition::NAT_HERE
        } else {
            Condition::NAT_THERE
        };
        let hosts = ike_sa.dynamic_hosts(local);

        let ts = if self.mode == IpsecMode::Transport && ike_sa.has_condition(cond) {
            let endpoint = if local {
                ike_sa.my_host()
            } else {
                ike_sa.other_host()
            };
            let nat = substitute_host_address(supplied, endpoint);
            config.get_traffic_selectors(local, Some(&nat), &hosts)
        } else {
            config.get_traffic_selectors(local, Some(supplied), &hosts)
        };
        logging::log_ts_narrowed(local, ts.len());
        ts
    }

    fn check_mode(&self, i_host: &std::net::IpAddr, r_host: &std::net::IpAddr) -> bool {
        let config = self.config.as_ref().expect("config selected");
        match self.mode {
            IpsecMode::Transport => {
                if !config.has_option(ChildOptions::PROXY_MODE)
                    && (!ts_list_is_host(&self.tsi, Some(i_host))
                        || !ts_list_is_host(&self.tsr, Some(r_host)))
                {
                    debug!("not using transport mode, not host-to-host");
                    return false;
                }
                config.get_mode() == IpsecMode::Transport
            }
            IpsecMode::Beet => {
                if !ts_list_is_host(&self.tsi, None) || !ts_list_is_host(&self.tsr, None) {
                    debug!("not using BEET mode, not host-to-host");
                    return false;
                }
                config.get_mode() == IpsecMode::Beet
            }
            IpsecMode::Tunnel => true,
        }
    }

    /// Narrow the selector pair and validate the negotiated mode
    fn narrow_and_check_ts(&mut self, ike_auth: bool, ike_sa: &IkeSa) -> InstallOutcome {
        let me = ike_sa.my_host();
        let other = ike_sa.other_host();

        if let (Some(child_sa), Some(proposal)) = (&mut self.child_sa, &self.proposal) {
            child_sa.set_proposal(proposal.clone());
        }

        let (my_in, other_in) = if self.initiator {
            (self.tsi.clone(), self.tsr.clone())
        } else {
            (self.tsr.clone(), self.tsi.clone())
        };
        let my_ts = self.narrow_ts(true, &my_in, ike_sa);
        let other_ts = self.narrow_ts(false, &other_in, ike_sa);

        let phase = if self.initiator {
            if ike_auth {
                NarrowPhase::InitiatorPostNoAuth
            } else {
                NarrowPhase::InitiatorPostAuth
            }
        } else {
            NarrowPhase::Responder
        };
        self.ctx.bus.narrow(phase, &my_ts, &other_ts);

        if my_ts.is_empty() || other_ts.is_empty() {
            self.ctx.bus.alert(Alert::TsMismatch);
            warn!("no acceptable traffic selectors found");
            return InstallOutcome::TsRejected;
        }

        if self.initiator {
            self.tsi = my_ts;
            self.tsr = other_ts;
            if !self.check_mode(&me, &other) {
                warn!(mode = %self.mode, "mode requested by responder is unacceptable");
                return InstallOutcome::Failed;
            }
        } else {
            self.tsr = my_ts;
            self.tsi = other_ts;
            if !self.check_mode(&other, &me) {
                self.mode = IpsecMode::Tunnel;
            }
        }
        InstallOutcome::Installed
    }

    /// Derive keys and install SAs plus policies into the kernel
    fn install_child_sa(&mut self, ike_sa: &mut IkeSa) -> InstallOutcome {
        let (nonce_i, nonce_r) = if self.initiator {
            (self.my_nonce.as_slice(), self.other_nonce.as_slice())
        } else {
            (self.other_nonce.as_slice(), self.my_nonce.as_slice())
        };

        let (my_ts, other_ts) = if self.initiator {
            (self.tsi.clone(), self.tsr.clone())
        } else {
            // The post hook operates on a copy, the exchanged payloads
            // must not change anymore.
            let my_ts = self.tsr.clone();
            let other_ts = self.tsi.clone();
            self.ctx
                .bus
                .narrow(NarrowPhase::ResponderPost, &my_ts, &other_ts);
            if my_ts.is_empty() || other_ts.is_empty() {
                return InstallOutcome::TsRejected;
            }
            (my_ts, other_ts)
        };

        if self.my_cpi == 0 || self.other_cpi == 0 || self.ipcomp == IpcompTransform::None {
            self.my_cpi = 0;
            self.other_cpi = 0;
            self.ipcomp = IpcompTransform::None;
        }

        let proposal = self.proposal.clone().expect("proposal selected");
        let Some(child_sa) = self.child_sa.as_mut() else {
            return InstallOutcome::Failed;
        };

        child_sa.set_ipcomp(self.ipcomp, self.my_cpi, self.other_cpi);
        child_sa.set_mode(self.mode);
        child_sa.set_protocol(proposal.protocol_id);
        child_sa.set_state(ChildSaState::Installing);

        // Addresses may have changed since the request was sent; update
        // them before any kernel state is configured.
        child_sa.update(
            ike_sa.my_host(),
            ike_sa.other_host(),
            ike_sa.has_condition(Condition::NAT_ANY),
        );
        child_sa.set_policies(my_ts, other_ts);

        let keys = match ike_sa
            .keymat()
            .derive_child_keys(&proposal, &self.kes, nonce_i, nonce_r)
        {
            Ok(keys) => keys,
            Err(e) => {
                logging::log_install_failed("keying material", &e.to_string());
                self.ctx.bus.alert(Alert::InstallChildSaFailed);
                return InstallOutcome::Failed;
            }
        };

        let (inbound_encr, inbound_integ, outbound_encr, outbound_integ) = if self.initiator {
            (&keys.encr_r, &keys.integ_r, &keys.encr_i, &keys.integ_i)
        } else {
            (&keys.encr_i, &keys.integ_i, &keys.encr_r, &keys.integ_r)
        };

        let status_in = child_sa.install(
            inbound_encr,
            inbound_integ,
            self.my_spi,
            self.my_cpi,
            true,
            self.tfcv3,
        );
        let status_out = if status_in.is_err() {
            // Never bring up the outbound half on a failed inbound install
            Err(crate::ipsec::Error::Kernel("inbound install failed".into()))
        } else if self.rekey {
            // During rekeyings the outbound SA is activated separately,
            // once the delete for the old SA arrives
            child_sa.register_outbound(
                outbound_encr,
                outbound_integ,
                self.other_spi,
                self.other_cpi,
                self.tfcv3,
            )
        } else {
            child_sa.install(
                outbound_encr,
                outbound_integ,
                self.other_spi,
                self.other_cpi,
                false,
                self.tfcv3,
            )
        };

        if let Err(e) = status_in.and(status_out) {
            logging::log_install_failed("IPsec SA (SAD)", &e.to_string());
            self.ctx.bus.alert(Alert::InstallChildSaFailed);
            return InstallOutcome::Failed;
        }

        if let Err(e) = child_sa.install_policies() {
            logging::log_install_failed("IPsec policies (SPD)", &e.to_string());
            self.ctx.bus.alert(Alert::InstallChildPolicyFailed);
            return InstallOutcome::TsRejected;
        }

        let unique_id = child_sa.unique_id();
        self.ctx.bus.child_derived_keys(unique_id, self.initiator);
        self.ctx
            .bus
            .child_keys(unique_id, self.initiator, nonce_i, nonce_r);

        child_sa.set_state(ChildSaState::Installed);
        logging::log_child_established(
            child_sa.name(),
            unique_id,
            child_sa.spi(true),
            child_sa.spi(false),
            child_sa.outbound_state() == crate::ipsec::child_sa::OutboundState::Installed,
        );

        let child_sa = self.child_sa.take().expect("present above");
        self.schedule_inactivity_timeout(&child_sa);
        ike_sa.add_child_sa(child_sa);
        self.established = true;
        InstallOutcome::Installed
    }

    fn schedule_inactivity_timeout(&self, child_sa: &ChildSa) {
        if let Some(timeout) = child_sa.config().inactivity {
            self.ctx.scheduler.schedule(
                timeout,
                Job::InactivityTimeout {
                    child_id: child_sa.unique_id(),
                    timeout,
                    close_ike: self.settings().inactivity_close_ike,
                },
            );
        }
    }

    fn schedule_delayed_retry(&self) {
        let Some(config) = &self.config else {
            return;
        };
        let jitter_secs = self.settings().retry_jitter.as_secs().max(1);
        let delay = self.settings().retry_interval
            - Duration::from_secs(rand::thread_rng().gen_range(0..jitter_secs));

        logging::log_retry_scheduled(&config.name, delay.as_secs());
        self.ctx.scheduler.schedule(
            delay,
            Job::RetryChildCreate(ChildCreateBlueprint {
                config: config.clone(),
                reqid: self.child.reqid,
                marks: (self.child.mark_in, self.child.mark_out),
                if_ids: (self.child.if_id_in, self.child.if_id_out),
                label: self.child.label.clone(),
                packet_tsi: self.packet_tsi.clone(),
                packet_tsr: self.packet_tsr.clone(),
            }),
        );
    }

    fn handle_child_sa_failure(&self, ike_sa: &IkeSa, message: &Message) {
        if self.aborted {
            return;
        }
        let is_first = message.exchange_type() == ExchangeType::IkeAuth;
        if is_first && self.settings().close_ike_on_child_failure {
            // The IKE_AUTH response must hit the wire before the delete
            info!("closing IKE_SA due to CHILD_SA setup failure");
            self.ctx.scheduler.schedule(
                CLOSE_IKE_DELAY,
                Job::DeleteIkeSa {
                    ike_sa_id: ike_sa.unique_id(),
                },
            );
        } else {
            logging::log_child_failed_keeping_ike("child-scoped error");
            self.ctx
                .bus
                .alert(Alert::KeepOnChildSaFailure { is_first });
        }
    }

    fn raise_alerts(&self, notify_type: NotifyType) {
        if notify_type == NotifyType::NoProposalChosen {
            self.ctx.bus.alert(Alert::ProposalMismatchChild);
        }
    }

    /// Switch to deleting the failed SA if SPIs were already allocated
    fn delete_failed_sa(&mut self) -> TaskStatus {
        if self.my_spi != 0 {
            self.build_state = BuildState::Delete;
            self.child_sa = None;
            TaskStatus::NeedMore
        } else {
            TaskStatus::Success
        }
    }

    /// Record the current exchange as done; true once all are done
    fn key_exchange_done(&mut self) -> bool {
        let Some(ke) = self.ke.take() else {
            return true;
        };
        if let Some((index, _)) = self.plan.next_pending() {
            self.plan.mark_done(index);
        }
        self.kes.push(ke);
        self.plan.all_done()
    }

    fn add_ke_payload(&mut self, message: &mut Message) -> bool {
        let payload = if let Some(ke) = &self.ke {
            Some((ke.method(), ke.public_key()))
        } else {
            self.kes.last().map(|ke| (ke.method(), ke.public_key()))
        };
        match payload {
            None => true,
            Some((method, Ok(data))) => {
                message.add_payload(Payload::Ke(KePayload::new(method, data)));
                true
            }
            Some((_, Err(e))) => {
                warn!(error = %e, "creating KE payload failed");
                false
            }
        }
    }

    fn build_payloads_multi_ke(&mut self, message: &mut Message) -> bool {
        if !self.add_ke_payload(message) {
            return false;
        }
        if let Some(link) = &self.link {
            message.add_notify_data(NotifyType::AdditionalKeyExchange, link.clone());
        }
        true
    }

    fn build_payloads(&mut self, message: &mut Message) -> bool {
        if message.exchange_type() == ExchangeType::IkeFollowupKe {
            return self.build_payloads_multi_ke(message);
        }

        let sa_payload = if self.initiator {
            SaPayload::new(self.proposals.clone())
        } else {
            SaPayload::from_proposal(self.proposal.clone().expect("proposal selected"))
        };
        message.add_payload(Payload::Sa(sa_payload));

        if message.exchange_type() == ExchangeType::CreateChildSa {
            match NoncePayload::new(self.my_nonce.clone()) {
                Ok(nonce) => message.add_payload(Payload::Nonce(nonce)),
                Err(_) => return false,
            }
        }

        if let Some(link) = &self.link {
            message.add_notify_data(NotifyType::AdditionalKeyExchange, link.clone());
        }

        if !self.add_ke_payload(message) {
            return false;
        }

        message.add_payload(Payload::Tsi(TsPayload::new(
            self.tsi.clone(),
            self.child.label.clone(),
        )));
        message.add_payload(Payload::Tsr(TsPayload::new(
            self.tsr.clone(),
            self.child.label.clone(),
        )));

        match self.mode {
            IpsecMode::Transport => message.add_notify(NotifyType::UseTransportMode),
            IpsecMode::Beet => message.add_notify(NotifyType::UseBeetMode),
            IpsecMode::Tunnel => {}
        }

        if !self
            .ctx
            .kernel
            .features()
            .has(KernelFeatures::ESP_V3_TFC)
        {
            message.add_notify(NotifyType::EspTfcPaddingNotSupported);
        }
        true
    }

    fn add_ipcomp_notify(&mut self, message: &mut Message, transform: IpcompTransform) {
        let cpi = match self.child_sa.as_mut() {
            Some(child_sa) => child_sa.alloc_cpi(),
            None => 0,
        };
        if cpi != 0 {
            self.my_cpi = cpi;
            self.ipcomp = transform;
            message.add_payload(Payload::Notify(NotifyPayload::ipcomp_supported(
                cpi, transform,
            )));
        } else {
            warn!("unable to allocate a CPI from kernel, IPComp disabled");
        }
    }

    fn handle_notify(&mut self, notify: &NotifyPayload, ike_sa: &IkeSa) {
        match notify.notify_type {
            NotifyType::UseTransportMode => {
                self.mode = IpsecMode::Transport;
            }
            NotifyType::UseBeetMode => {
                if ike_sa.supports_extension(Extension::STRONGSWAN) {
                    // Private-use notify, only safe with a known peer
                    self.mode = IpsecMode::Beet;
                } else {
                    warn!("received BEET mode notify, but peer implementation unknown, skipped");
                }
            }
            NotifyType::IpcompSupported => match notify.ipcomp_parameters() {
                Some((cpi, IpcompTransform::Deflate)) => {
                    self.other_cpi = cpi;
                    self.ipcomp_received = IpcompTransform::Deflate;
                }
                _ => {
                    warn!("received IPCOMP_SUPPORTED notify with an unsupported transform");
                }
            },
            NotifyType::EspTfcPaddingNotSupported => {
                debug!("peer does not support ESPv3 TFC padding");
                self.tfcv3 = false;
            }
            _ => {}
        }
    }

    fn process_payloads(&mut self, message: &Message, ike_sa: &IkeSa) {
        self.mode = IpsecMode::Tunnel;

        for payload in message.payloads() {
            match payload {
                Payload::Sa(sa) => self.proposals = sa.proposals.clone(),
                Payload::Ke(ke) => self.process_ke_payload(ke),
                Payload::Tsi(ts) => {
                    self.tsi = ts.selectors.clone();
                    self.labels_i = ts.labels.clone();
                }
                Payload::Tsr(ts) => {
                    self.tsr = ts.selectors.clone();
                    self.labels_r = ts.labels.clone();
                }
                Payload::Notify(notify) => self.handle_notify(notify, ike_sa),
                _ => {}
            }
        }
    }

    fn process_link(&mut self, message: &Message) {
        match message.get_notify(NotifyType::AdditionalKeyExchange) {
            Some(notify) => {
                if self.initiator {
                    debug!(link = %hex::encode(&notify.data), "received link token");
                    self.link = Some(notify.data.clone());
                } else {
                    let matches = self
                        .link
                        .as_ref()
                        .map(|link| bool::from(link.as_slice().ct_eq(notify.data.as_slice())))
                        .unwrap_or(false);
                    if !matches {
                        warn!("data in ADDITIONAL_KEY_EXCHANGE notify doesn't match");
                        self.link = None;
                    }
                }
            }
            None => self.link = None,
        }
    }

    fn process_payloads_multi_ke(&mut self, message: &Message) {
        match message.ke_payload() {
            Some(ke) => self.process_ke_payload(ke),
            None => {
                warn!("KE payload missing in message");
                self.ke_failed = true;
            }
        }
        self.process_link(message);
    }

    /// Check whether the CHILD_SA should wait for a childless IKE_SA
    fn defer_child_sa(&self, ike_sa: &IkeSa) -> Childless {
        let policy = ike_sa.ike_cfg().childless;
        if ike_sa.supports_extension(Extension::IKE_CHILDLESS) {
            // With SELinux we also prefer not to create a CHILD_SA from
            // the generic label; it would most likely fail
            if policy == ChildlessPolicy::Prefer
                || policy == ChildlessPolicy::Force
                || self.generic_label_only()
            {
                return Childless::Defer;
            }
        } else if policy == ChildlessPolicy::Force {
            warn!("peer does not support childless IKE_SA initiation");
            return Childless::Fatal;
        }
        Childless::Continue
    }

    /// Validate a (possibly) childless IKE_AUTH request as responder
    ///
    /// Returns Some(status) when the request diverts from regular
    /// CHILD_SA creation.
    fn handle_childless(&self, ike_sa: &IkeSa, message: &mut Message) -> Option<TaskStatus> {
        let policy = ike_sa.ike_cfg().childless;
        if self.proposals.is_empty() && self.tsi.is_empty() && self.tsr.is_empty() {
            if policy == ChildlessPolicy::Never {
                warn!("peer tried to initiate a childless IKE_SA");
                message.add_notify(NotifyType::InvalidSyntax);
                return Some(TaskStatus::Failed);
            }
            return Some(TaskStatus::Success);
        }
        if policy == ChildlessPolicy::Force {
            warn!("peer did not initiate a childless IKE_SA");
            message.add_notify(NotifyType::InvalidSyntax);
            return Some(TaskStatus::Failed);
        }
        None
    }

    /// A CHILD_SA equal to the one being created is already installed
    fn check_for_duplicate(&self, ike_sa: &IkeSa) -> bool {
        let Some(child_sa) = &self.child_sa else {
            return false;
        };
        let found = ike_sa.child_sas().iter().find(|existing| {
            existing.state() == ChildSaState::Installed && existing.is_duplicate_of(child_sa)
        });
        if let Some(found) = found {
            info!(
                child = child_sa.name(),
                unique_id = child_sa.unique_id(),
                duplicate = found.unique_id(),
                "not establishing CHILD_SA due to existing duplicate"
            );
            return true;
        }
        false
    }

    fn check_for_generic_label(&self) -> bool {
        if self.generic_label_only() {
            if let Some(child_sa) = &self.child_sa {
                info!(
                    child = child_sa.name(),
                    unique_id = child_sa.unique_id(),
                    "not establishing CHILD_SA with generic label"
                );
            }
            return true;
        }
        false
    }

    /// Reset all per-round state for the INVALID_KE_PAYLOAD retry,
    /// keeping the reserved reqid/marks/if-ids/label and the retried
    /// method
    fn reset_for_retry(&mut self) {
        self.my_nonce.clear();
        self.other_nonce.clear();
        self.link = None;
        self.tsi.clear();
        self.tsr.clear();
        self.labels_i.clear();
        self.labels_r.clear();
        self.child_sa = None;
        self.proposal = None;
        self.proposals.clear();
        self.ke = None;
        self.kes.clear();
        self.ke_failed = false;
        self.plan.clear();
        self.mode = IpsecMode::Tunnel;
        self.ipcomp = IpcompTransform::None;
        self.ipcomp_received = IpcompTransform::None;
        self.my_spi = 0;
        self.other_spi = 0;
        self.my_cpi = 0;
        self.other_cpi = 0;
        self.established = false;
        self.build_state = BuildState::Normal;
        self.process_state = ProcessState::Normal;
    }

    // --- initiator ---

    fn build_i(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        let mut no_ke = true;
        match message.exchange_type() {
            ExchangeType::IkeSaInit => {
                // Piggyback: only pick up our nonce from the init message
                return match Self::get_nonce(message) {
                    Some(nonce) => {
                        self.my_nonce = nonce;
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                self.generate_nonce(ike_sa);
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                match self.defer_child_sa(ike_sa) {
                    Childless::Fatal => return TaskStatus::DestroyMe,
                    Childless::Defer => {
                        // Create the CHILD_SA after the IKE_SA is done
                        self.my_nonce.clear();
                        return TaskStatus::NeedMore;
                    }
                    Childless::Continue => {}
                }
                // Send only in the first request, not in later rounds
                self.build_state = BuildState::NeedMoreOnly;
            }
            _ => return TaskStatus::NeedMore,
        }

        let config = match &self.config {
            Some(config) => config.clone(),
            None => return TaskStatus::Failed,
        };

        // Propose wildcard selectors while a virtual IP is pending;
        // otherwise derive them from our current addresses
        let vips = if self.rekey {
            Vec::new()
        } else {
            ike_sa.requested_virtual_ips()
        };
        self.tsi = if vips.is_empty() {
            config.get_traffic_selectors(true, None, &ike_sa.dynamic_hosts(true))
        } else {
            let any: Vec<std::net::IpAddr> = vips
                .iter()
                .map(|vip| {
                    if vip.is_ipv4() {
                        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
                    } else {
                        std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                    }
                })
                .collect();
            config.get_traffic_selectors(true, None, &any)
        };
        self.tsr = config.get_traffic_selectors(false, None, &ike_sa.dynamic_hosts(false));

        if let Some(packet_tsi) = &self.packet_tsi {
            self.tsi.insert(0, packet_tsi.clone());
        }
        if let Some(packet_tsr) = &self.packet_tsr {
            self.tsr.insert(0, packet_tsr.clone());
        }

        if !self.generic_label_only() && self.child.label.is_none() {
            // In simple label mode we propose the configured label, as
            // there are no labels from acquires
            self.child.label = config.label.clone();
        }
        if let Some(label) = &self.child.label {
            debug!(label = %label, "proposing security label");
        }

        self.proposals = config.get_proposals(no_ke);
        self.mode = config.get_mode();

        self.child.if_id_in_def = ike_sa.if_id(true);
        self.child.if_id_out_def = ike_sa.if_id(false);
        self.child.encap = ike_sa.has_condition(Condition::NAT_ANY);
        self.child_sa = Some(ChildSa::new(
            ike_sa.my_host(),
            ike_sa.other_host(),
            config.clone(),
            &self.child,
            self.ctx.kernel.clone(),
        ));

        if !self.rekey
            && message.exchange_type() == ExchangeType::CreateChildSa
            && (self.check_for_generic_label() || self.check_for_duplicate(ike_sa))
        {
            message.set_exchange_type(ExchangeType::Undefined);
            return TaskStatus::Success;
        }

        if let Some(child_sa) = &self.child_sa {
            logging::log_child_initiated(child_sa.name(), child_sa.unique_id(), self.child.reqid);
        }

        self.proto = self
            .proposals
            .first()
            .map(|p| p.protocol_id)
            .unwrap_or(ProtocolId::Esp);
        self.my_spi = match self.child_sa.as_mut() {
            Some(child_sa) => child_sa.alloc_spi(self.proto),
            None => 0,
        };
        if self.my_spi == 0 {
            warn!("unable to allocate SPI from kernel");
            message.set_exchange_type(ExchangeType::Undefined);
            return TaskStatus::Success;
        }

        if !no_ke && !self.retry && self.ke_method.is_none() {
            // During a rekeying the method may already be set
            self.ke_method = config.preferred_ke_method();
        }

        if !self.update_and_check_proposals() {
            warn!(
                method = %self.ke_method,
                "requested key exchange method not contained in any of our proposals"
            );
            return TaskStatus::Failed;
        }

        if !self.ke_method.is_none() {
            self.ke = self.ctx.ke_provider.create(self.ke_method, true);
            if self.ke.is_none() {
                warn!(method = %self.ke_method, "selected key exchange method not supported");
                message.set_exchange_type(ExchangeType::Undefined);
                return TaskStatus::Success;
            }
        }

        if config.has_option(ChildOptions::IPCOMP) {
            // DEFLATE is the only transform supported
            self.add_ipcomp_notify(message, IpcompTransform::Deflate);
        }

        let phase = if message.exchange_type() == ExchangeType::IkeAuth {
            NarrowPhase::InitiatorPreNoAuth
        } else {
            NarrowPhase::InitiatorPreAuth
        };
        self.ctx.bus.narrow(phase, &self.tsi, &self.tsr);

        if !self.build_payloads(message) {
            return TaskStatus::Failed;
        }
        TaskStatus::NeedMore
    }

    fn build_i_multi_ke(&mut self, message: &mut Message) -> TaskStatus {
        message.set_exchange_type(ExchangeType::IkeFollowupKe);

        let Some((index, method)) = self.plan.next_pending() else {
            return TaskStatus::Failed;
        };
        logging::log_ke_round(index, self.plan.len(), &method.to_string());
        self.ke = self.ctx.ke_provider.create(method, true);
        if self.ke.is_none() {
            warn!(method = %method, "negotiated key exchange method not supported");
            return TaskStatus::Failed;
        }
        if self.link.is_none() {
            warn!("ADDITIONAL_KEY_EXCHANGE notify missing");
            return TaskStatus::Failed;
        }
        if !self.build_payloads_multi_ke(message) {
            return TaskStatus::Failed;
        }
        TaskStatus::NeedMore
    }

    fn build_i_delete(&mut self, message: &mut Message) -> TaskStatus {
        message.set_exchange_type(ExchangeType::Informational);
        if self.my_spi != 0 {
            message.add_payload(Payload::Delete(DeletePayload::new(
                self.proto,
                vec![self.my_spi],
            )));
            logging::log_child_delete_sent(self.my_spi);
        }
        TaskStatus::Success
    }

    /// Complete the current key exchange and install if all are done
    fn key_exchange_done_and_install_i(
        &mut self,
        ike_sa: &mut IkeSa,
        message: &Message,
    ) -> TaskStatus {
        if self.key_exchange_done() {
            if self.install_child_sa(ike_sa) == InstallOutcome::Installed {
                if !self.rekey {
                    if let Some(child_sa) = ike_sa.child_sas().last() {
                        self.ctx.bus.child_updown(child_sa.unique_id(), true);
                    }
                }
                return TaskStatus::Success;
            }
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        let mut no_ke = true;
        let mut ike_auth = false;
        match message.exchange_type() {
            ExchangeType::IkeSaInit => {
                return match Self::get_nonce(message) {
                    Some(nonce) => {
                        self.other_nonce = nonce;
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if let Some(nonce) = Self::get_nonce(message) {
                    self.other_nonce = nonce;
                }
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                if !ike_sa.has_condition(Condition::AUTHENTICATED) {
                    // Wait until all authentication rounds completed
                    return TaskStatus::NeedMore;
                }
                if self.defer_child_sa(ike_sa) == Childless::Defer {
                    self.other_nonce.clear();
                    return TaskStatus::NeedMore;
                }
                ike_auth = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        // Check for erroneous notifies before any payload processing
        for notify in message.notifies() {
            let notify_type = notify.notify_type;
            match notify_type {
                NotifyType::NoProposalChosen
                | NotifyType::SinglePairRequired
                | NotifyType::NoAdditionalSas
                | NotifyType::InternalAddressFailure
                | NotifyType::FailedCpRequired
                | NotifyType::TsUnacceptable
                | NotifyType::InvalidSelectors => {
                    logging::log_error_notify(&notify_type.to_string());
                    self.raise_alerts(notify_type);
                    self.handle_child_sa_failure(ike_sa, message);
                    // An error in CHILD_SA creation is not critical
                    return TaskStatus::Success;
                }
                NotifyType::TemporaryFailure => {
                    debug!("received TEMPORARY_FAILURE notify");
                    if !self.rekey && !self.aborted {
                        // The rekey task retries itself if necessary
                        self.schedule_delayed_retry();
                    }
                    return TaskStatus::Success;
                }
                NotifyType::InvalidKePayload => {
                    if self.aborted {
                        debug!("received INVALID_KE_PAYLOAD notify in aborted task");
                        return TaskStatus::Success;
                    }
                    let alg = notify.suggested_ke_method().unwrap_or(KeMethod::NONE);
                    if self.retry {
                        warn!(
                            ours = %self.ke_method,
                            requested = %alg,
                            "already retried with key exchange method, ignoring request"
                        );
                        self.handle_child_sa_failure(ike_sa, message);
                        return TaskStatus::Success;
                    }
                    logging::log_ke_retry(&alg.to_string());
                    self.retry = true;
                    self.ke_method = alg;
                    if let Some(child_sa) = self.child_sa.as_mut() {
                        child_sa.set_state(ChildSaState::Retrying);
                    }
                    self.reset_for_retry();
                    return TaskStatus::NeedMore;
                }
                other => {
                    if message.exchange_type() == ExchangeType::CreateChildSa && other.is_error() {
                        logging::log_error_notify(&other.to_string());
                        return TaskStatus::Success;
                    }
                }
            }
        }

        self.process_payloads(message, ike_sa);

        if !self.select_proposal(no_ke, ike_sa) {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }
        let selected = self.proposal.as_mut().expect("selected above");
        self.other_spi = selected.spi();
        selected.set_spi(self.my_spi);

        if self.aborted {
            info!(
                spi_in = %format_args!("{:08x}", self.my_spi),
                spi_out = %format_args!("{:08x}", self.other_spi),
                "deleting CHILD_SA of aborted task"
            );
            return self.delete_failed_sa();
        }

        // IPComp must be symmetric: the peer may only mirror what we
        // proposed, with the same transform
        if self.ipcomp == IpcompTransform::None && self.ipcomp_received != IpcompTransform::None {
            warn!("received an IPCOMP_SUPPORTED notify without requesting one, no CHILD_SA built");
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        } else if self.ipcomp != IpcompTransform::None
            && self.ipcomp_received == IpcompTransform::None
        {
            debug!("peer didn't accept our proposed IPComp transforms, IPComp is disabled");
            self.ipcomp = IpcompTransform::None;
            self.my_cpi = 0;
        } else if self.ipcomp != IpcompTransform::None && self.ipcomp != self.ipcomp_received {
            warn!("received an IPCOMP_SUPPORTED notify we didn't propose, no CHILD_SA built");
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.check_ke_method().is_err() {
            warn!("key exchange method not contained in selected proposal");
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.ke_failed {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if !self.determine_key_exchanges() {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if !self.select_label() {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        if self.narrow_and_check_ts(ike_auth, ike_sa) != InstallOutcome::Installed {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        let status = self.key_exchange_done_and_install_i(ike_sa, message);
        if status == TaskStatus::NeedMore {
            // Unless the install failed and build() was switched to the
            // delete handler, move to the follow-up exchanges
            if self.build_state == BuildState::Normal
                || self.build_state == BuildState::NeedMoreOnly
            {
                self.process_link(message);
                self.build_state = BuildState::MultiKe;
                self.process_state = ProcessState::MultiKe;
            }
        }
        status
    }

    fn process_i_multi_ke(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        if message.get_notify(NotifyType::TemporaryFailure).is_some() {
            debug!("received TEMPORARY_FAILURE notify");
            if !self.rekey && !self.aborted {
                self.schedule_delayed_retry();
            }
            return TaskStatus::Success;
        }

        self.process_payloads_multi_ke(message);

        if self.ke_failed || self.aborted {
            self.handle_child_sa_failure(ike_sa, message);
            return self.delete_failed_sa();
        }

        self.key_exchange_done_and_install_i(ike_sa, message)
    }

    // --- responder ---

    fn process_r(&mut self, ike_sa: &mut IkeSa, message: &Message) -> TaskStatus {
        match message.exchange_type() {
            ExchangeType::IkeSaInit => {
                return match Self::get_nonce(message) {
                    Some(nonce) => {
                        self.other_nonce = nonce;
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                if let Some(nonce) = Self::get_nonce(message) {
                    self.other_nonce = nonce;
                }
            }
            ExchangeType::IkeAuth => {
                // Only handle the first AUTH round, not additional ones
                self.process_state = ProcessState::NeedMoreOnly;
            }
            _ => return TaskStatus::NeedMore,
        }

        self.process_payloads(message, ike_sa);
        TaskStatus::NeedMore
    }

    fn process_r_multi_ke(&mut self, message: &Message) -> TaskStatus {
        if message.exchange_type() == ExchangeType::IkeFollowupKe {
            self.process_payloads_multi_ke(message);
        }
        TaskStatus::NeedMore
    }

    /// Select a matching child configuration from the peer configuration
    fn select_child_cfg(&self, ike_sa: &IkeSa) -> Option<Arc<ChildConfig>> {
        let peer_cfg = ike_sa.peer_cfg()?;
        if self.tsi.is_empty() || self.tsr.is_empty() {
            return None;
        }

        let my_hosts = ike_sa.dynamic_hosts(true);
        let other_hosts = ike_sa.dynamic_hosts(false);
        let labels: Vec<SecLabel> = self.labels_i.clone();

        // With transport mode behind NAT, try the substituted selectors
        // first; a non-transport match on them is rejected
        let nat_tsr = self.nat_transport_ts(true, &self.tsr, ike_sa);
        let nat_tsi = self.nat_transport_ts(false, &self.tsi, ike_sa);
        if nat_tsr.is_some() || nat_tsi.is_some() {
            let selected = peer_cfg.select_child_cfg(
                nat_tsr.as_deref().unwrap_or(&self.tsr),
                nat_tsi.as_deref().unwrap_or(&self.tsi),
                &my_hosts,
                &other_hosts,
                &labels,
            );
            match selected {
                Some(cfg) if cfg.get_mode() == IpsecMode::Transport => return Some(cfg),
                _ => {
                    // No match for the substituted NAT selectors (or a
                    // non-transport one), retry with the originals
                }
            }
        }

        peer_cfg.select_child_cfg(&self.tsr, &self.tsi, &my_hosts, &other_hosts, &labels)
    }

    fn nat_transport_ts(
        &self,
        local: bool,
        list: &[TrafficSelector],
        ike_sa: &IkeSa,
    ) -> Option<Vec<TrafficSelector>> {
        if self.mode != IpsecMode::Transport {
            return None;
        }
        let cond = if local {
            Condition::NAT_HERE
        } else {
            Condition::NAT_THERE
        };
        if !ike_sa.has_condition(cond) {
            return None;
        }
        let endpoint = if local {
            ike_sa.my_host()
        } else {
            ike_sa.other_host()
        };
        let out = substitute_host_address(list, endpoint);
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Validate the received KE method, requesting another one from the
    /// peer if the proposal expects it
    fn check_ke_method_r(&mut self, message: &mut Message) -> bool {
        match self.check_ke_method() {
            Err(expected) => {
                warn!(
                    received = %self.ke_method,
                    requesting = %expected,
                    "key exchange method unacceptable"
                );
                message.add_payload(Payload::Notify(NotifyPayload::invalid_ke(expected)));
                false
            }
            Ok(()) => {
                if !self.ke_method.is_none() && self.ke.is_none() {
                    message.add_notify(NotifyType::NoProposalChosen);
                    return false;
                }
                true
            }
        }
    }

    /// Complete the current key exchange and install once all are done
    ///
    /// Returns false while further IKE_FOLLOWUP_KE rounds are required.
    fn key_exchange_done_and_install_r(
        &mut self,
        ike_sa: &mut IkeSa,
        message: &mut Message,
    ) -> bool {
        let mut all_done = false;
        if self.key_exchange_done() {
            self.link = None;
            all_done = true;
        } else if self.link.is_none() {
            self.link = Some(vec![INITIAL_LINK_TOKEN]);
        }

        if !self.build_payloads(message) {
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return true;
        }

        if all_done {
            match self.install_child_sa(ike_sa) {
                InstallOutcome::Installed => {}
                InstallOutcome::TsRejected => {
                    message.add_notify(NotifyType::TsUnacceptable);
                    self.handle_child_sa_failure(ike_sa, message);
                    return true;
                }
                InstallOutcome::Failed => {
                    message.add_notify(NotifyType::NoProposalChosen);
                    self.handle_child_sa_failure(ike_sa, message);
                    return true;
                }
            }
            if !self.rekey {
                if let Some(child_sa) = ike_sa.child_sas().last() {
                    self.ctx.bus.child_updown(child_sa.unique_id(), true);
                }
            }
        }
        all_done
    }

    fn build_r(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        let mut no_ke = true;
        let mut ike_auth = false;
        match message.exchange_type() {
            ExchangeType::IkeSaInit => {
                // Piggyback: pick up the nonce the init task generated
                return match Self::get_nonce(message) {
                    Some(nonce) => {
                        self.my_nonce = nonce;
                        TaskStatus::NeedMore
                    }
                    None => TaskStatus::Failed,
                };
            }
            ExchangeType::CreateChildSa => {
                self.generate_nonce(ike_sa);
                no_ke = false;
            }
            ExchangeType::IkeAuth => {
                if !ike_sa.has_condition(Condition::AUTHENTICATED) {
                    // Wait until all authentication rounds completed
                    return TaskStatus::NeedMore;
                }
                if ike_sa.has_condition(Condition::REDIRECTED) {
                    // No CHILD_SA is created for redirected SAs
                    return TaskStatus::Success;
                }
                if let Some(status) = self.handle_childless(ike_sa, message) {
                    return status;
                }
                ike_auth = true;
            }
            _ => return TaskStatus::NeedMore,
        }

        match ike_sa.state() {
            IkeSaState::Rekeying => {
                warn!("unable to create CHILD_SA while rekeying IKE_SA");
                message.add_notify(NotifyType::TemporaryFailure);
                return TaskStatus::Success;
            }
            IkeSaState::Deleting => {
                warn!("unable to create CHILD_SA while deleting IKE_SA");
                message.add_notify(NotifyType::TemporaryFailure);
                return TaskStatus::Success;
            }
            _ => {}
        }

        if self.config.is_none() {
            self.config = self.select_child_cfg(ike_sa);
        }
        if self.config.is_none() || self.tsi.is_empty() || self.tsr.is_empty() {
            if self.tsi.is_empty() || self.tsr.is_empty() {
                warn!("TS payloads missing in message");
            } else {
                warn!("traffic selectors unacceptable");
                self.ctx.bus.alert(Alert::TsMismatch);
            }
            message.add_notify(NotifyType::TsUnacceptable);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        // The configuration-payload task may already have added error
        // notifies to this response
        let cp_failed = message.notifies().any(|n| {
            matches!(
                n.notify_type,
                NotifyType::InternalAddressFailure | NotifyType::FailedCpRequired
            )
        });
        if cp_failed {
            warn!("configuration payload negotiation failed, no CHILD_SA built");
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        if !self.select_proposal(no_ke, ike_sa) {
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        if !self.check_ke_method_r(message) {
            // The peer will retry; this is not a failure of ours
            return TaskStatus::Success;
        }

        // The check above may have reset this flag for a non-PFS proposal
        if self.ke_failed {
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        if !self.determine_key_exchanges() {
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        if !self.select_label() {
            message.add_notify(NotifyType::TsUnacceptable);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }

        let config = self.config.clone().expect("selected above");
        self.child.if_id_in_def = ike_sa.if_id(true);
        self.child.if_id_out_def = ike_sa.if_id(false);
        self.child.encap = ike_sa.has_condition(Condition::NAT_ANY);
        self.child_sa = Some(ChildSa::new(
            ike_sa.my_host(),
            ike_sa.other_host(),
            config.clone(),
            &self.child,
            self.ctx.kernel.clone(),
        ));

        let selected = self.proposal.as_mut().expect("selected above");
        self.other_spi = selected.spi();
        self.proto = selected.protocol_id;
        self.my_spi = match self.child_sa.as_mut() {
            Some(child_sa) => child_sa.alloc_spi(self.proto),
            None => 0,
        };
        if self.my_spi == 0 {
            warn!("unable to allocate SPI from kernel");
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if let Some(proposal) = self.proposal.as_mut() {
            proposal.set_spi(self.my_spi);
        }

        if self.ipcomp_received != IpcompTransform::None {
            if config.has_option(ChildOptions::IPCOMP) {
                let transform = self.ipcomp_received;
                self.add_ipcomp_notify(message, transform);
            } else {
                debug!("received IPCOMP_SUPPORTED notify but IPComp is disabled, ignoring");
            }
        }

        match self.narrow_and_check_ts(ike_auth, ike_sa) {
            InstallOutcome::Installed => {}
            InstallOutcome::TsRejected => {
                message.add_notify(NotifyType::TsUnacceptable);
                self.handle_child_sa_failure(ike_sa, message);
                return TaskStatus::Success;
            }
            InstallOutcome::Failed => {
                message.add_notify(NotifyType::NoProposalChosen);
                self.handle_child_sa_failure(ike_sa, message);
                return TaskStatus::Success;
            }
        }

        if !self.key_exchange_done_and_install_r(ike_sa, message) {
            self.build_state = BuildState::MultiKe;
            self.process_state = ProcessState::MultiKe;
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }

    fn build_r_multi_ke(&mut self, ike_sa: &mut IkeSa, message: &mut Message) -> TaskStatus {
        message.set_exchange_type(ExchangeType::IkeFollowupKe);
        if self.ke.is_none() {
            message.add_notify(NotifyType::InvalidSyntax);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if self.ke_failed {
            message.add_notify(NotifyType::NoProposalChosen);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if self.link.is_none() {
            warn!("ADDITIONAL_KEY_EXCHANGE notify missing");
            message.add_notify(NotifyType::StateNotFound);
            self.handle_child_sa_failure(ike_sa, message);
            return TaskStatus::Success;
        }
        if !self.key_exchange_done_and_install_r(ike_sa, message) {
            return TaskStatus::NeedMore;
        }
        TaskStatus::Success
    }
}

impl Drop for ChildCreate {
    fn drop(&mut self) {
        if self.child.reqid != 0 {
            self.ctx.kernel.release_reqid(self.child.reqid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::bus::RecordingBus;
    use crate::ipsec::config::{ChildConfig, IkeConfig, Settings, TsTemplate};
    use crate::ipsec::ikev2::ke::mock::MockKeProvider;
    use crate::ipsec::ikev2::keymat::{Keymat, PrfAlgorithm};
    use crate::ipsec::ikev2::proposal::{EncrTransformId, Transform};
    use crate::ipsec::scheduler::RecordingScheduler;
    use ironwire_platform::MemoryKernel;

    fn context() -> Arc<TaskContext> {
        Arc::new(TaskContext {
            kernel: Arc::new(MemoryKernel::default()),
            bus: Arc::new(RecordingBus::default()),
            scheduler: Arc::new(RecordingScheduler::default()),
            ke_provider: Arc::new(MockKeProvider::default()),
            settings: Arc::new(Settings::default()),
        })
    }

    fn config() -> Arc<ChildConfig> {
        Arc::new(
            ChildConfig::builder("net-net")
                .with_proposal(
                    Proposal::new(1, ProtocolId::Esp)
                        .add_transform(Transform::encr(EncrTransformId::AesGcm256))
                        .add_transform(Transform::ke(KeMethod::CURVE_25519))
                        .add_transform(Transform::ke(KeMethod::ECP_256)),
                )
                .with_local_ts(TsTemplate::Fixed(
                    TrafficSelector::subnet("10.1.0.0".parse().unwrap(), 16).unwrap(),
                ))
                .with_remote_ts(TsTemplate::Fixed(
                    TrafficSelector::subnet("10.2.0.0".parse().unwrap(), 16).unwrap(),
                ))
                .build()
                .unwrap(),
        )
    }

    fn ike_sa() -> IkeSa {
        let mut sa = IkeSa::new(
            true,
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            Arc::new(IkeConfig::default()),
            Keymat::new(PrfAlgorithm::HmacSha256, vec![0x42; 32]),
        );
        sa.set_state(IkeSaState::Established);
        sa.set_condition(Condition::AUTHENTICATED, true);
        sa
    }

    #[test]
    fn test_lower_nonce_lexicographic() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        task.my_nonce = vec![0x01, 0x02, 0x03];
        task.other_nonce = vec![0x01, 0x02, 0x04];
        assert_eq!(task.get_lower_nonce(), &[0x01, 0x02, 0x03][..]);

        task.my_nonce = vec![0xFF];
        task.other_nonce = vec![0x00, 0x01];
        assert_eq!(task.get_lower_nonce(), &[0x00, 0x01][..]);
    }

    #[test]
    fn test_lower_nonce_prefix_tie_prefers_ours() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        task.my_nonce = vec![0x01, 0x02];
        task.other_nonce = vec![0x01, 0x02, 0xFF];
        assert_eq!(task.get_lower_nonce(), &[0x01, 0x02][..]);
    }

    #[test]
    fn test_use_reqid_reserves_and_releases() {
        let kernel = Arc::new(MemoryKernel::default());
        let ctx = Arc::new(TaskContext {
            kernel: kernel.clone(),
            bus: Arc::new(RecordingBus::default()),
            scheduler: Arc::new(RecordingScheduler::default()),
            ke_provider: Arc::new(MockKeProvider::default()),
            settings: Arc::new(Settings::default()),
        });

        {
            let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
            task.use_reqid(9);
            assert_eq!(kernel.reqid_refs(9), 1);

            // Replacing drops the previous reservation
            task.use_reqid(10);
            assert_eq!(kernel.reqid_refs(9), 0);
            assert_eq!(kernel.reqid_refs(10), 1);
        }
        // Dropped task releases its reservation
        assert_eq!(kernel.reqid_refs(10), 0);
    }

    #[test]
    fn test_build_create_child_sa_request_payloads() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut ike = ike_sa();
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);

        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);
        assert!(msg.sa_payload().is_some());
        assert!(msg.nonce_payload().is_some());
        assert!(msg.ke_payload().is_some());
        assert!(msg.tsi_payload().is_some());
        assert!(msg.tsr_payload().is_some());
        // Tunnel mode: no mode notify
        assert!(msg.get_notify(NotifyType::UseTransportMode).is_none());
        assert!(task.get_child().is_some());
    }

    #[test]
    fn test_ike_auth_request_has_no_nonce_or_ke() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut ike = ike_sa();

        // Nonce is picked up from the IKE_SA_INIT message
        let mut init = Message::new(ExchangeType::IkeSaInit, true);
        init.add_payload(Payload::Nonce(NoncePayload::new(vec![1u8; 32]).unwrap()));
        assert_eq!(task.build(&mut ike, &mut init), TaskStatus::NeedMore);

        let mut msg = Message::new(ExchangeType::IkeAuth, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);
        assert!(msg.sa_payload().is_some());
        assert!(msg.nonce_payload().is_none());
        assert!(msg.ke_payload().is_none());
        // KE transforms are stripped from the offered proposals
        assert!(msg.sa_payload().unwrap().proposals[0]
            .get_transform(TransformType::Ke)
            .is_none());
    }

    #[test]
    fn test_duplicate_suppresses_exchange() {
        let ctx = context();
        let mut ike = ike_sa();

        // Establish one CHILD_SA
        let mut first = ChildCreate::new_initiator(ctx.clone(), config(), false, None, None);
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(first.build(&mut ike, &mut msg), TaskStatus::NeedMore);
        let mut child_sa = ChildSa::new(
            ike.my_host(),
            ike.other_host(),
            config(),
            &ChildSaParams::default(),
            ctx.kernel.clone(),
        );
        child_sa.set_state(ChildSaState::Installed);
        ike.add_child_sa(child_sa);

        // A second identical creation is suppressed
        let mut second = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(second.build(&mut ike, &mut msg), TaskStatus::Success);
        assert_eq!(msg.exchange_type(), ExchangeType::Undefined);
    }

    #[test]
    fn test_childless_force_against_unsupporting_peer() {
        let ctx = context();
        let mut ike = IkeSa::new(
            true,
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            Arc::new(IkeConfig {
                childless: ChildlessPolicy::Force,
            }),
            Keymat::new(PrfAlgorithm::HmacSha256, vec![0x42; 32]),
        );
        ike.set_condition(Condition::AUTHENTICATED, true);

        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut msg = Message::new(ExchangeType::IkeAuth, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::DestroyMe);
    }

    #[test]
    fn test_childless_prefer_defers() {
        let ctx = context();
        let mut ike = IkeSa::new(
            true,
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            Arc::new(IkeConfig {
                childless: ChildlessPolicy::Prefer,
            }),
            Keymat::new(PrfAlgorithm::HmacSha256, vec![0x42; 32]),
        );
        ike.set_condition(Condition::AUTHENTICATED, true);
        ike.enable_extension(Extension::IKE_CHILDLESS);

        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut msg = Message::new(ExchangeType::IkeAuth, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);
        assert!(msg.sa_payload().is_none());
    }

    #[test]
    fn test_abort_before_first_build() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        task.abort();
        assert!(task.aborted);
        assert!(task.get_child().is_none());
    }

    #[test]
    fn test_temporary_failure_schedules_retry() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = Arc::new(TaskContext {
            kernel: Arc::new(MemoryKernel::default()),
            bus: Arc::new(RecordingBus::default()),
            scheduler: scheduler.clone(),
            ke_provider: Arc::new(MockKeProvider::default()),
            settings: Arc::new(Settings::default()),
        });
        let mut ike = ike_sa();

        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        task.use_reqid(5);
        task.use_marks(11, 12);

        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_notify(NotifyType::TemporaryFailure);
        assert_eq!(task.process(&mut ike, &response), TaskStatus::Success);

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        let settings = Settings::default();
        assert!(jobs[0].0 <= settings.retry_interval);
        assert!(jobs[0].0 >= settings.retry_interval - settings.retry_jitter);
        match &jobs[0].1 {
            Job::RetryChildCreate(bp) => {
                assert_eq!(bp.reqid, 5);
                assert_eq!(bp.marks, (11, 12));
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[test]
    fn test_rekey_suppresses_delayed_retry() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = Arc::new(TaskContext {
            kernel: Arc::new(MemoryKernel::default()),
            bus: Arc::new(RecordingBus::default()),
            scheduler: scheduler.clone(),
            ke_provider: Arc::new(MockKeProvider::default()),
            settings: Arc::new(Settings::default()),
        });
        let mut ike = ike_sa();

        let mut task = ChildCreate::new_initiator(ctx, config(), true, None, None);
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_notify(NotifyType::TemporaryFailure);
        assert_eq!(task.process(&mut ike, &response), TaskStatus::Success);
        assert!(scheduler.jobs().is_empty());
    }

    #[test]
    fn test_error_notify_abandons_child_keeps_ike() {
        let bus = Arc::new(RecordingBus::default());
        let ctx = Arc::new(TaskContext {
            kernel: Arc::new(MemoryKernel::default()),
            bus: bus.clone(),
            scheduler: Arc::new(RecordingScheduler::default()),
            ke_provider: Arc::new(MockKeProvider::default()),
            settings: Arc::new(Settings::default()),
        });
        let mut ike = ike_sa();

        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_notify(NotifyType::NoProposalChosen);
        assert_eq!(task.process(&mut ike, &response), TaskStatus::Success);
        assert!(!task.is_established());
        assert!(bus
            .alerts()
            .contains(&Alert::KeepOnChildSaFailure { is_first: false }));
    }

    #[test]
    fn test_unknown_status_notify_ignored() {
        let ctx = context();
        let mut ike = ike_sa();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);

        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        // A status notify (>= 16384) must not abort processing; the
        // message is otherwise empty so the proposal check fails and the
        // task switches to deleting the allocated SPI, which proves we
        // got past the notify scan.
        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_notify(NotifyType::Other(20000));
        assert_eq!(task.process(&mut ike, &response), TaskStatus::NeedMore);

        let mut delete = Message::new(ExchangeType::Informational, true);
        assert_eq!(task.build(&mut ike, &mut delete), TaskStatus::Success);
        assert!(delete.delete_payload().is_some());
    }

    #[test]
    fn test_unknown_error_notify_abandons_child() {
        let ctx = context();
        let mut ike = ike_sa();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);

        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        // An unknown error notify (< 16384) abandons the CHILD_SA
        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_notify(NotifyType::Other(100));
        assert_eq!(task.process(&mut ike, &response), TaskStatus::Success);
        assert!(!task.is_established());
    }

    #[test]
    fn test_invalid_ke_payload_retry_only_once() {
        let ctx = context();
        let mut ike = ike_sa();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);

        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);

        // First INVALID_KE_PAYLOAD: retry with the requested method
        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_payload(Payload::Notify(NotifyPayload::invalid_ke(KeMethod::ECP_256)));
        assert_eq!(task.process(&mut ike, &response), TaskStatus::NeedMore);
        assert!(task.retry);
        assert_eq!(task.ke_method, KeMethod::ECP_256);

        // Rebuild with the new method
        let mut msg = Message::new(ExchangeType::CreateChildSa, true);
        assert_eq!(task.build(&mut ike, &mut msg), TaskStatus::NeedMore);
        assert_eq!(msg.ke_payload().unwrap().method, KeMethod::ECP_256);

        // A second INVALID_KE_PAYLOAD abandons the task
        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add_payload(Payload::Notify(NotifyPayload::invalid_ke(
            KeMethod::MODP_2048,
        )));
        assert_eq!(task.process(&mut ike, &response), TaskStatus::Success);
        assert!(!task.is_established());
    }

    #[test]
    fn test_ke_plan_reset_on_retry() {
        let ctx = context();
        let mut task = ChildCreate::new_initiator(ctx, config(), false, None, None);
        task.my_nonce = vec![1u8; 32];
        task.my_spi = 7;
        task.reset_for_retry();
        assert!(task.my_nonce.is_empty());
        assert_eq!(task.my_spi, 0);
        assert!(task.plan.is_empty());
        assert_eq!(task.build_state, BuildState::Normal);
    }
}
