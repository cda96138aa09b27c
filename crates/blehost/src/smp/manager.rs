//! Per-link Security Manager
//!
//! One `SecurityManager` exists per connection. Inbound PDUs are fed in by
//! the connection's link thread through [`SecurityManager::handle_pdu`] and
//! dispatched through a table keyed by opcode and role. Outbound PDUs and
//! requests to start encryption leave through an [`SmpTransport`].

use super::bond::{Bond, BondStore};
use super::constants::*;
use super::crypto::{self, KeyPair};
use super::pairing::*;
use super::pdu::{PairingFeatures, SmpPdu};
use super::types::*;
use crate::address::Address;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Link services the Security Manager needs
pub trait SmpTransport: Send + Sync {
    /// Send one PDU on the SMP fixed channel
    fn send(&self, pdu: &[u8]) -> SmpResult<()>;

    /// Ask the controller to encrypt the link with `bond` (central only)
    fn encrypt(&self, bond: &Bond) -> SmpResult<()>;
}

/// Outcome of a pairing attempt
pub type PairingResult = SmpResult<Bond>;

/// Mutable pairing state of one link
pub struct Machine {
    ctx: Option<PairingContext>,
    auth: AuthData,
    waiter: Option<Sender<PairingResult>>,
    level: SecurityLevel,
}

type Handler = fn(&SecurityManager, &mut Machine, SmpPdu) -> SmpResult<()>;

fn handlers() -> &'static HashMap<(u8, PairingRole), Handler> {
    static TABLE: OnceLock<HashMap<(u8, PairingRole), Handler>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use PairingRole::*;

        let mut table: HashMap<(u8, PairingRole), Handler> = HashMap::new();
        table.insert((SMP_PAIRING_RESPONSE, Initiator), SecurityManager::on_pairing_response);
        table.insert((SMP_SECURITY_REQUEST, Initiator), SecurityManager::on_security_request);
        table.insert((SMP_PAIRING_REQUEST, Responder), SecurityManager::on_pairing_request);

        table.insert((SMP_PAIRING_CONFIRM, Initiator), SecurityManager::initiator_confirm);
        table.insert((SMP_PAIRING_CONFIRM, Responder), SecurityManager::responder_confirm);
        table.insert((SMP_PAIRING_RANDOM, Initiator), SecurityManager::initiator_random);
        table.insert((SMP_PAIRING_RANDOM, Responder), SecurityManager::responder_random);
        table.insert((SMP_PAIRING_DHK_CHECK, Initiator), SecurityManager::initiator_dhkey_check);
        table.insert((SMP_PAIRING_DHK_CHECK, Responder), SecurityManager::responder_dhkey_check);

        for role in [Initiator, Responder] {
            table.insert((SMP_PAIRING_PUBLIC_KEY, role), SecurityManager::on_public_key);
            table.insert((SMP_PAIRING_FAILED, role), SecurityManager::on_pairing_failed);
            table.insert((SMP_PAIRING_KEYPRESS_NOTIFICATION, role), SecurityManager::on_keypress);
            for opcode in [
                SMP_ENCRYPTION_INFORMATION,
                SMP_MASTER_IDENTIFICATION,
                SMP_IDENTITY_INFORMATION,
                SMP_IDENTITY_ADDRESS_INFORMATION,
                SMP_SIGNING_INFORMATION,
            ] {
                table.insert((opcode, role), SecurityManager::on_key);
            }
        }
        table
    })
}

/// Security Manager for one link
pub struct SecurityManager {
    role: PairingRole,
    local: Address,
    peer: Address,
    config: PairingConfig,
    timeout: Duration,
    transport: Arc<dyn SmpTransport>,
    bonds: Arc<dyn BondStore>,
    machine: Mutex<Machine>,
}

impl std::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityManager")
            .field("role", &self.role)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SecurityManager {
    pub fn new(
        role: PairingRole,
        local: Address,
        peer: Address,
        config: PairingConfig,
        transport: Arc<dyn SmpTransport>,
        bonds: Arc<dyn BondStore>,
    ) -> Self {
        Self {
            role,
            local,
            peer,
            config,
            timeout: Duration::from_secs(SMP_TIMEOUT_SECS),
            transport,
            bonds,
            machine: Mutex::new(Machine {
                ctx: None,
                auth: AuthData::default(),
                waiter: None,
                level: SecurityLevel::None,
            }),
        }
    }

    /// Override the SMP transaction timer
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.machine.lock().unwrap().level
    }

    /// Bond stored for the peer, if any
    pub fn bond(&self) -> Option<Bond> {
        self.bonds.find(&self.peer)
    }

    /// Replace the user interaction data used by peer-initiated pairing
    pub fn set_auth(&self, auth: AuthData) {
        self.machine.lock().unwrap().auth = auth;
    }

    pub fn is_pairing(&self) -> bool {
        self.machine
            .lock()
            .unwrap()
            .ctx
            .as_ref()
            .map(PairingContext::is_active)
            .unwrap_or(false)
    }

    /// Start pairing and return a receiver for the outcome
    ///
    /// The central sends a Pairing Request; the peripheral sends a Security
    /// Request and the outcome arrives once the central pairs or encrypts.
    pub fn initiate(&self, auth: AuthData) -> SmpResult<Receiver<PairingResult>> {
        let mut m = self.machine.lock().unwrap();
        if m.waiter.is_some() || m.ctx.as_ref().map(PairingContext::is_active).unwrap_or(false) {
            return Err(SmpError::InProgress);
        }
        m.auth = auth;

        let (tx, rx) = bounded(1);
        let started = match self.role {
            PairingRole::Initiator => self.begin_pairing(&mut m),
            PairingRole::Responder => self.send(&SmpPdu::SecurityRequest(self.config.auth_req)),
        };
        if let Err(err) = started {
            m.ctx = None;
            return Err(err);
        }
        m.waiter = Some(tx);
        Ok(rx)
    }

    /// Pair and wait for the outcome
    ///
    /// On timeout the attempt is aborted and the peer told so.
    pub fn pair(&self, auth: AuthData, timeout: Duration) -> PairingResult {
        let outcome = self.initiate(auth)?;
        match outcome.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.abort(SmpError::Timeout);
                Err(SmpError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(SmpError::Closed),
        }
    }

    /// Abandon any pairing attempt, sending Pairing Failed if one is active
    pub fn abort(&self, err: SmpError) {
        let mut m = self.machine.lock().unwrap();
        let active = m.ctx.is_some();
        self.fail(&mut m, err, active);
    }

    /// Fail the attempt after the link went away; nothing is sent
    pub fn close(&self) {
        let mut m = self.machine.lock().unwrap();
        if m.ctx.is_some() || m.waiter.is_some() {
            self.fail(&mut m, SmpError::Closed, false);
        }
        m.level = SecurityLevel::None;
    }

    /// Enforce the SMP transaction timer; called periodically by the link
    pub fn poll_timeout(&self) {
        let mut m = self.machine.lock().unwrap();
        let expired = m
            .ctx
            .as_ref()
            .map(|ctx| ctx.is_active() && ctx.started.elapsed() >= self.timeout)
            .unwrap_or(false);
        if expired {
            self.fail(&mut m, SmpError::Timeout, true);
        }
    }

    /// Handle one PDU received on the SMP channel
    pub fn handle_pdu(&self, data: &[u8]) -> SmpResult<()> {
        let mut m = self.machine.lock().unwrap();

        let result = SmpPdu::parse(data).and_then(|pdu| match handlers().get(&(pdu.opcode(), self.role)) {
            Some(handler) => handler(self, &mut m, pdu),
            None => Err(SmpError::PairingNotSupported),
        });

        if let Err(err) = &result {
            let notify_peer = !matches!(err, SmpError::PairingFailed(_));
            self.fail(&mut m, err.clone(), notify_peer);
        }
        result
    }

    /// Link encryption changed (Encryption Change or Key Refresh)
    pub fn on_encrypted(&self, status: u8, enabled: bool) {
        let mut m = self.machine.lock().unwrap();

        if status != 0 {
            if m.ctx.is_some() || m.waiter.is_some() {
                self.fail(&mut m, SmpError::EncryptionFailed(status), false);
            }
            return;
        }
        if !enabled {
            m.level = SecurityLevel::None;
            return;
        }

        let pairing = m
            .ctx
            .as_ref()
            .map(|ctx| ctx.state == PairingState::WaitEncryption)
            .unwrap_or(false);
        if pairing {
            if let Err(err) = self.start_key_distribution(&mut m) {
                self.fail(&mut m, err, true);
            }
            return;
        }

        // Encrypted with a stored bond
        let bond = self.bonds.find(&self.peer);
        m.level = bond
            .as_ref()
            .map(Bond::security_level)
            .unwrap_or(SecurityLevel::EncryptionOnly);
        debug!("smp: link to {} encrypted at {:?}", self.peer, m.level);
        if let Some(waiter) = m.waiter.take() {
            let _ = waiter.try_send(bond.ok_or(SmpError::NotPaired));
        }
    }

    /// Key for an LE Long Term Key Request, if we have one
    pub fn long_term_key(&self, ediv: u16, rand: &[u8; 8]) -> Option<[u8; 16]> {
        let m = self.machine.lock().unwrap();
        if let Some(ctx) = m.ctx.as_ref() {
            if ctx.state == PairingState::WaitEncryption && ediv == 0 && rand == &[0u8; 8] {
                return Some(ctx.key);
            }
        }
        drop(m);
        self.bonds
            .find(&self.peer)
            .filter(|bond| bond.matches(ediv, rand))
            .map(|bond| bond.ltk)
    }

    // Internals

    fn send(&self, pdu: &SmpPdu) -> SmpResult<()> {
        self.transport.send(&pdu.serialize())
    }

    fn fail(&self, m: &mut Machine, err: SmpError, notify_peer: bool) {
        m.ctx = None;
        if notify_peer {
            if let Err(e) = self.send(&SmpPdu::PairingFailed(err.reason_code())) {
                debug!("smp: could not send Pairing Failed: {}", e);
            }
        }
        warn!("smp: pairing with {} failed: {}", self.peer, err);
        if let Some(waiter) = m.waiter.take() {
            let _ = waiter.try_send(Err(err));
        }
    }

    /// `(A, B)`: initiator and responder addresses
    fn addresses(&self) -> (Address, Address) {
        match self.role {
            PairingRole::Initiator => (self.local, self.peer),
            PairingRole::Responder => (self.peer, self.local),
        }
    }

    fn begin_pairing(&self, m: &mut Machine) -> SmpResult<()> {
        let features = PairingFeatures::from_config(&self.config, self.role);
        let mut ctx = PairingContext::new(PairingState::WaitPairingResponse);
        ctx.preq = features.to_pdu(SMP_PAIRING_REQUEST);
        m.ctx = Some(ctx);
        info!("smp: pairing with {}", self.peer);
        self.send(&SmpPdu::PairingRequest(features))
    }

    fn context<'a>(m: &'a mut Machine, state: PairingState, what: &'static str) -> SmpResult<&'a mut PairingContext> {
        match m.ctx.as_mut() {
            Some(ctx) if ctx.state == state => Ok(ctx),
            _ => Err(SmpError::UnexpectedPdu(what)),
        }
    }

    /// Passkey this side uses: displayed (and reported) or typed in
    fn passkey(&self, auth: &AuthData, inputs: bool) -> SmpResult<u32> {
        let configured = auth.passkey.or(self.config.passkey);
        let passkey = if inputs {
            configured.ok_or(SmpError::PasskeyEntryFailed)?
        } else {
            let passkey = configured.unwrap_or_else(crypto::generate_passkey);
            if let Some(display) = &auth.display {
                display(passkey);
            }
            passkey
        };
        if passkey > SMP_PASSKEY_MAX {
            return Err(SmpError::PasskeyEntryFailed);
        }
        Ok(passkey)
    }

    fn compare(&self, auth: &AuthData, value: u32) -> SmpResult<()> {
        let accepted = auth.confirm.as_ref().map(|confirm| confirm(value)).unwrap_or(true);
        if accepted {
            Ok(())
        } else {
            Err(SmpError::NumericComparisonFailed)
        }
    }

    fn legacy_confirm(&self, ctx: &PairingContext, random: &[u8; 16]) -> [u8; 16] {
        let (a, b) = self.addresses();
        crypto::c1(&ctx.tk, random, &ctx.preq, &ctx.pres, a.kind.to_u8(), &a.bytes, b.kind.to_u8(), &b.bytes)
    }

    /// Set up the legacy TK or the Secure Connections passkey
    fn prepare_method(&self, ctx: &mut PairingContext, auth: &AuthData) -> SmpResult<()> {
        let negotiated = ctx.negotiated()?;
        if negotiated.association.method == PairingMethod::PasskeyEntry {
            ctx.passkey = self.passkey(auth, negotiated.association.inputs(self.role))?;
            if !negotiated.secure_connections {
                ctx.tk = crypto::passkey_to_128(ctx.passkey);
            }
        }
        Ok(())
    }

    fn passkey_confirm(&self, ctx: &PairingContext) -> SmpResult<[u8; 16]> {
        let (pkax, pkbx) = ctx.public_x(self.role)?;
        let z = ctx.passkey_bit();
        Ok(match self.role {
            PairingRole::Initiator => crypto::f4(&pkax, &pkbx, &ctx.local_random, z),
            PairingRole::Responder => crypto::f4(&pkbx, &pkax, &ctx.local_random, z),
        })
    }

    /// Derive MacKey and LTK once both nonces are known
    fn derive_sc_keys(&self, ctx: &mut PairingContext) {
        let (a, b) = self.addresses();
        let (na, nb) = ctx.nonces(self.role);
        let (mac_key, mut ltk) = crypto::f5(&ctx.dhkey, &na, &nb, &a.to_smp_bytes(), &b.to_smp_bytes());
        if let Some(negotiated) = ctx.negotiated {
            crypto::truncate_key(&mut ltk, negotiated.key_size);
        }
        ctx.mac_key = mac_key;
        ctx.key = ltk;
    }

    /// Ea when `for_initiator`, else Eb
    fn dhkey_check_value(&self, ctx: &PairingContext, for_initiator: bool) -> SmpResult<[u8; 16]> {
        let negotiated = ctx.negotiated()?;
        let r = if negotiated.association.method == PairingMethod::PasskeyEntry {
            crypto::passkey_to_128(ctx.passkey)
        } else {
            [0u8; 16]
        };
        let (a, b) = self.addresses();
        let (a, b) = (a.to_smp_bytes(), b.to_smp_bytes());
        let (na, nb) = ctx.nonces(self.role);
        let mut io_a = [0u8; 3];
        let mut io_b = [0u8; 3];
        io_a.copy_from_slice(&ctx.preq[1..4]);
        io_b.copy_from_slice(&ctx.pres[1..4]);

        Ok(if for_initiator {
            crypto::f6(&ctx.mac_key, &na, &nb, &r, &io_a, &a, &b)
        } else {
            crypto::f6(&ctx.mac_key, &nb, &na, &r, &io_b, &b, &a)
        })
    }

    fn numeric_comparison(&self, ctx: &PairingContext, auth: &AuthData) -> SmpResult<()> {
        if ctx.negotiated()?.association.method != PairingMethod::NumericComparison {
            return Ok(());
        }
        let (pkax, pkbx) = ctx.public_x(self.role)?;
        let (na, nb) = ctx.nonces(self.role);
        self.compare(auth, crypto::g2(&pkax, &pkbx, &na, &nb))
    }

    fn link_bond(&self, ctx: &PairingContext) -> SmpResult<Bond> {
        let negotiated = ctx.negotiated()?;
        let mut bond = Bond::new(ctx.key, 0, [0; 8], !negotiated.secure_connections);
        bond.authenticated = negotiated.authenticated();
        bond.key_size = negotiated.key_size;
        Ok(bond)
    }

    // Feature exchange

    fn on_pairing_request(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingRequest(request) = pdu else {
            return Err(SmpError::UnexpectedPdu("pairing request"));
        };
        if m.ctx.as_ref().map(PairingContext::is_active).unwrap_or(false) {
            return Err(SmpError::UnexpectedPdu("pairing request"));
        }

        let local = PairingFeatures::from_config(&self.config, self.role);
        let response = PairingFeatures {
            initiator_keys: request.initiator_keys & local.initiator_keys,
            responder_keys: request.responder_keys & local.responder_keys,
            ..local
        };
        let negotiated = negotiate(&request, &response, self.config.auth_req)?;

        let mut ctx = PairingContext::new(if negotiated.secure_connections {
            PairingState::WaitPublicKey
        } else {
            PairingState::WaitConfirm
        });
        ctx.preq = request.to_pdu(SMP_PAIRING_REQUEST);
        ctx.pres = response.to_pdu(SMP_PAIRING_RESPONSE);
        ctx.negotiated = Some(negotiated);
        info!(
            "smp: {} requested pairing, {} {}",
            self.peer,
            if negotiated.secure_connections { "secure connections" } else { "legacy" },
            negotiated.association.method
        );

        self.send(&SmpPdu::PairingResponse(response))?;
        if !negotiated.secure_connections {
            self.prepare_method(&mut ctx, &m.auth)?;
        }
        m.ctx = Some(ctx);
        Ok(())
    }

    fn on_pairing_response(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingResponse(response) = pdu else {
            return Err(SmpError::UnexpectedPdu("pairing response"));
        };
        let auth = m.auth.clone();
        let ctx = Self::context(m, PairingState::WaitPairingResponse, "pairing response")?;
        ctx.pres = response.to_pdu(SMP_PAIRING_RESPONSE);

        let request = PairingFeatures::from_config(&self.config, self.role);
        let negotiated = negotiate(&request, &response, self.config.auth_req)?;
        ctx.negotiated = Some(negotiated);
        debug!(
            "smp: {} accepted pairing, key size {}, {}",
            self.peer, negotiated.key_size, negotiated.association.method
        );
        self.prepare_method(ctx, &auth)?;

        if negotiated.secure_connections {
            let keypair = KeyPair::generate();
            let public = SmpPdu::PairingPublicKey { x: keypair.x, y: keypair.y };
            ctx.keypair = Some(keypair);
            ctx.state = PairingState::WaitPublicKey;
            self.send(&public)
        } else {
            let random = crypto::generate_random_128();
            ctx.local_random = random;
            let confirm = self.legacy_confirm(ctx, &random);
            ctx.state = PairingState::WaitConfirm;
            self.send(&SmpPdu::PairingConfirm(confirm))
        }
    }

    fn on_security_request(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::SecurityRequest(auth_req) = pdu else {
            return Err(SmpError::UnexpectedPdu("security request"));
        };
        if m.ctx.as_ref().map(PairingContext::is_active).unwrap_or(false) {
            debug!("smp: security request from {} ignored, pairing in progress", self.peer);
            return Ok(());
        }
        match self.bonds.find(&self.peer) {
            Some(bond) if !auth_req.contains(AuthRequirements::MITM) || bond.authenticated => {
                debug!("smp: security request from {}, encrypting with stored bond", self.peer);
                self.transport.encrypt(&bond)
            }
            _ => self.begin_pairing(m),
        }
    }

    fn on_public_key(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingPublicKey { x, y } = pdu else {
            return Err(SmpError::UnexpectedPdu("public key"));
        };
        let auth = m.auth.clone();
        let ctx = Self::context(m, PairingState::WaitPublicKey, "public key")?;
        let negotiated = ctx.negotiated()?;

        if self.role == PairingRole::Responder {
            ctx.keypair = Some(KeyPair::generate());
        }
        let keypair = ctx.keypair.as_ref().ok_or(SmpError::UnexpectedPdu("public key"))?;
        if keypair.x == x && keypair.y == y {
            return Err(SmpError::InvalidParameter("peer reflected our public key".into()));
        }
        ctx.dhkey = keypair.dhkey(&x, &y)?;
        ctx.remote_x = x;
        ctx.remote_y = y;
        let own = SmpPdu::PairingPublicKey { x: keypair.x, y: keypair.y };

        if self.role == PairingRole::Responder {
            self.send(&own)?;
            self.prepare_method(ctx, &auth)?;
        }

        match (self.role, negotiated.association.method) {
            (PairingRole::Responder, PairingMethod::PasskeyEntry) => {
                ctx.state = PairingState::WaitConfirm;
            }
            (PairingRole::Responder, _) => {
                ctx.local_random = crypto::generate_random_128();
                let (pkax, pkbx) = ctx.public_x(self.role)?;
                let confirm = crypto::f4(&pkbx, &pkax, &ctx.local_random, 0);
                ctx.state = PairingState::WaitRandom;
                self.send(&SmpPdu::PairingConfirm(confirm))?;
            }
            (PairingRole::Initiator, PairingMethod::PasskeyEntry) => {
                ctx.local_random = crypto::generate_random_128();
                let confirm = self.passkey_confirm(ctx)?;
                ctx.state = PairingState::WaitConfirm;
                self.send(&SmpPdu::PairingConfirm(confirm))?;
            }
            (PairingRole::Initiator, _) => {
                ctx.state = PairingState::WaitConfirm;
            }
        }
        Ok(())
    }

    // Confirm and random exchange

    fn initiator_confirm(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingConfirm(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("confirm"));
        };
        let ctx = Self::context(m, PairingState::WaitConfirm, "confirm")?;
        let negotiated = ctx.negotiated()?;
        ctx.remote_confirm = value;

        if negotiated.secure_connections && negotiated.association.method != PairingMethod::PasskeyEntry {
            ctx.local_random = crypto::generate_random_128();
        }
        ctx.state = PairingState::WaitRandom;
        self.send(&SmpPdu::PairingRandom(ctx.local_random))
    }

    fn responder_confirm(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingConfirm(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("confirm"));
        };
        let ctx = Self::context(m, PairingState::WaitConfirm, "confirm")?;
        let negotiated = ctx.negotiated()?;
        ctx.remote_confirm = value;
        let random = crypto::generate_random_128();
        ctx.local_random = random;

        let confirm = if negotiated.secure_connections {
            self.passkey_confirm(ctx)?
        } else {
            self.legacy_confirm(ctx, &random)
        };
        ctx.state = PairingState::WaitRandom;
        self.send(&SmpPdu::PairingConfirm(confirm))
    }

    fn initiator_random(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingRandom(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("random"));
        };
        let auth = m.auth.clone();
        let ctx = Self::context(m, PairingState::WaitRandom, "random")?;
        let negotiated = ctx.negotiated()?;
        ctx.remote_random = value;

        if !negotiated.secure_connections {
            if self.legacy_confirm(ctx, &value) != ctx.remote_confirm {
                return Err(SmpError::ConfirmValueFailed);
            }
            let mut stk = crypto::s1(&ctx.tk, &value, &ctx.local_random);
            crypto::truncate_key(&mut stk, negotiated.key_size);
            ctx.key = stk;
            ctx.state = PairingState::WaitEncryption;
            let bond = self.link_bond(ctx)?;
            return self.transport.encrypt(&bond);
        }

        let (pkax, pkbx) = ctx.public_x(self.role)?;
        if negotiated.association.method == PairingMethod::PasskeyEntry {
            if crypto::f4(&pkbx, &pkax, &value, ctx.passkey_bit()) != ctx.remote_confirm {
                return Err(SmpError::ConfirmValueFailed);
            }
            ctx.passkey_round += 1;
            if ctx.passkey_round < SMP_PASSKEY_ROUNDS {
                ctx.local_random = crypto::generate_random_128();
                let confirm = self.passkey_confirm(ctx)?;
                ctx.state = PairingState::WaitConfirm;
                return self.send(&SmpPdu::PairingConfirm(confirm));
            }
        } else {
            if crypto::f4(&pkbx, &pkax, &value, 0) != ctx.remote_confirm {
                return Err(SmpError::ConfirmValueFailed);
            }
            self.numeric_comparison(ctx, &auth)?;
        }

        self.derive_sc_keys(ctx);
        let ea = self.dhkey_check_value(ctx, true)?;
        ctx.state = PairingState::WaitDhKeyCheck;
        self.send(&SmpPdu::PairingDhKeyCheck(ea))
    }

    fn responder_random(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingRandom(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("random"));
        };
        let auth = m.auth.clone();
        let ctx = Self::context(m, PairingState::WaitRandom, "random")?;
        let negotiated = ctx.negotiated()?;
        ctx.remote_random = value;

        if !negotiated.secure_connections {
            if self.legacy_confirm(ctx, &value) != ctx.remote_confirm {
                return Err(SmpError::ConfirmValueFailed);
            }
            let mut stk = crypto::s1(&ctx.tk, &ctx.local_random, &value);
            crypto::truncate_key(&mut stk, negotiated.key_size);
            ctx.key = stk;
            ctx.state = PairingState::WaitEncryption;
            return self.send(&SmpPdu::PairingRandom(ctx.local_random));
        }

        let (pkax, pkbx) = ctx.public_x(self.role)?;
        if negotiated.association.method == PairingMethod::PasskeyEntry {
            if crypto::f4(&pkax, &pkbx, &value, ctx.passkey_bit()) != ctx.remote_confirm {
                return Err(SmpError::ConfirmValueFailed);
            }
            self.send(&SmpPdu::PairingRandom(ctx.local_random))?;
            ctx.passkey_round += 1;
            if ctx.passkey_round < SMP_PASSKEY_ROUNDS {
                ctx.state = PairingState::WaitConfirm;
                return Ok(());
            }
        } else {
            self.send(&SmpPdu::PairingRandom(ctx.local_random))?;
            self.numeric_comparison(ctx, &auth)?;
        }

        self.derive_sc_keys(ctx);
        ctx.state = PairingState::WaitDhKeyCheck;
        Ok(())
    }

    // DHKey check

    fn initiator_dhkey_check(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingDhKeyCheck(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("DHKey check"));
        };
        let ctx = Self::context(m, PairingState::WaitDhKeyCheck, "DHKey check")?;
        if self.dhkey_check_value(ctx, false)? != value {
            return Err(SmpError::DhKeyCheckFailed);
        }
        ctx.state = PairingState::WaitEncryption;
        let bond = self.link_bond(ctx)?;
        self.transport.encrypt(&bond)
    }

    fn responder_dhkey_check(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingDhKeyCheck(value) = pdu else {
            return Err(SmpError::UnexpectedPdu("DHKey check"));
        };
        let ctx = Self::context(m, PairingState::WaitDhKeyCheck, "DHKey check")?;
        if self.dhkey_check_value(ctx, true)? != value {
            return Err(SmpError::DhKeyCheckFailed);
        }
        let eb = self.dhkey_check_value(ctx, false)?;
        ctx.state = PairingState::WaitEncryption;
        self.send(&SmpPdu::PairingDhKeyCheck(eb))
    }

    // Key distribution

    fn start_key_distribution(&self, m: &mut Machine) -> SmpResult<()> {
        let ctx = Self::context(m, PairingState::WaitEncryption, "encryption change")?;
        let negotiated = ctx.negotiated()?;

        ctx.bond = self.link_bond(ctx)?;
        ctx.long_term = negotiated.secure_connections;

        let remote_role = match self.role {
            PairingRole::Initiator => PairingRole::Responder,
            PairingRole::Responder => PairingRole::Initiator,
        };
        ctx.expected_keys = expected_key_pdus(negotiated.keys_from(remote_role));
        ctx.state = PairingState::KeyDistribution;

        if self.role == PairingRole::Responder {
            self.distribute_keys(ctx)?;
        }
        let level = ctx.bond.security_level();
        m.level = level;
        info!("smp: link to {} encrypted at {:?}", self.peer, level);
        self.maybe_finish(m)
    }

    /// Send the keys this side agreed to distribute
    fn distribute_keys(&self, ctx: &mut PairingContext) -> SmpResult<()> {
        let negotiated = ctx.negotiated()?;
        let keys = negotiated.keys_from(self.role);

        if keys.contains(KeyDistribution::ENC_KEY) {
            let mut ltk = crypto::generate_random_128();
            crypto::truncate_key(&mut ltk, negotiated.key_size);
            let ediv = (OsRng.next_u32() & 0xFFFF) as u16;
            let mut rand = [0u8; 8];
            OsRng.fill_bytes(&mut rand);
            self.send(&SmpPdu::EncryptionInformation(ltk))?;
            self.send(&SmpPdu::MasterIdentification { ediv, rand })?;

            // Only the peripheral's key encrypts later links in these roles
            if self.role == PairingRole::Responder {
                ctx.bond.ltk = ltk;
                ctx.bond.ediv = ediv;
                ctx.bond.rand = rand;
                ctx.long_term = true;
            }
        }
        if keys.contains(KeyDistribution::ID_KEY) {
            let irk = self
                .config
                .identity_key
                .ok_or_else(|| SmpError::InvalidParameter("no identity key configured".into()))?;
            self.send(&SmpPdu::IdentityInformation(irk))?;
            self.send(&SmpPdu::IdentityAddressInformation(self.local))?;
        }
        if keys.contains(KeyDistribution::SIGN_KEY) {
            let csrk = self
                .config
                .signing_key
                .ok_or_else(|| SmpError::InvalidParameter("no signing key configured".into()))?;
            self.send(&SmpPdu::SigningInformation(csrk))?;
        }
        Ok(())
    }

    fn on_key(&self, m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let ctx = Self::context(m, PairingState::KeyDistribution, "key distribution")?;
        if ctx.expected_keys.front() != Some(&pdu.opcode()) {
            return Err(SmpError::UnexpectedPdu("key distribution"));
        }
        ctx.expected_keys.pop_front();

        match pdu {
            // The peripheral's key encrypts later links, so a responder keeps
            // the one it distributed
            SmpPdu::EncryptionInformation(_) | SmpPdu::MasterIdentification { .. }
                if self.role == PairingRole::Responder =>
            {
                debug!("smp: {} sent its own ltk, keeping ours", self.peer);
            }
            SmpPdu::EncryptionInformation(ltk) => {
                ctx.bond.ltk = ltk;
            }
            SmpPdu::MasterIdentification { ediv, rand } => {
                ctx.bond.ediv = ediv;
                ctx.bond.rand = rand;
                ctx.bond.legacy = true;
                ctx.long_term = true;
            }
            SmpPdu::IdentityInformation(irk) => ctx.bond.irk = Some(irk),
            SmpPdu::IdentityAddressInformation(address) => ctx.bond.identity = Some(address),
            SmpPdu::SigningInformation(csrk) => ctx.bond.csrk = Some(csrk),
            _ => return Err(SmpError::UnexpectedPdu("key distribution")),
        }
        self.maybe_finish(m)
    }

    fn maybe_finish(&self, m: &mut Machine) -> SmpResult<()> {
        let Some(ctx) = m.ctx.as_mut() else {
            return Ok(());
        };
        if ctx.state != PairingState::KeyDistribution || !ctx.expected_keys.is_empty() {
            return Ok(());
        }
        // Initiator keys go out once every responder key has arrived
        if self.role == PairingRole::Initiator {
            self.distribute_keys(ctx)?;
        }

        let negotiated = ctx.negotiated()?;
        ctx.state = PairingState::Paired;
        let bond = ctx.bond.clone();
        if negotiated.bonding && ctx.long_term {
            if let Err(err) = self.bonds.save(&self.peer, &bond) {
                warn!("smp: could not store bond for {}: {}", self.peer, err);
            }
        }
        m.ctx = None;
        m.level = bond.security_level();
        info!("smp: paired with {} ({:?})", self.peer, m.level);
        if let Some(waiter) = m.waiter.take() {
            let _ = waiter.try_send(Ok(bond));
        }
        Ok(())
    }

    // Misc

    fn on_pairing_failed(&self, _m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        let SmpPdu::PairingFailed(reason) = pdu else {
            return Err(SmpError::UnexpectedPdu("pairing failed"));
        };
        Err(SmpError::PairingFailed(reason))
    }

    fn on_keypress(&self, _m: &mut Machine, pdu: SmpPdu) -> SmpResult<()> {
        debug!("smp: keypress notification from {}: {:?}", self.peer, pdu);
        Ok(())
    }
}
