//! One LE link
//!
//! Each connection owns a link thread. The session's dispatch loop feeds it
//! ACL fragments and link-level events through a bounded queue; the thread
//! recombines L2CAP PDUs and routes them by channel: ATT to the read
//! queue, signaling and SMP handled in place, dynamic channels to the
//! credit based channel engine.
//!
//! Nothing on the link thread waits for a Command Complete. Commands it
//! needs (LTK replies, connection updates, starting encryption after
//! pairing) go through the session's deferred worker.

use super::recombine::Reassembler;
use super::{LinkParameters, Role};
use crate::address::{Address, AddressType};
use crate::error::{Error, HciError, Result};
use crate::hci::constants::*;
use crate::hci::event::LeConnectionComplete;
use crate::hci::{AclPacket, ConnectionParameters, HciCommand};
use crate::host::context::LinkContext;
use crate::l2cap::constants::*;
use crate::l2cap::signaling::{L2capCommandHeader, SignalId};
use crate::l2cap::{
    CocChannelInfo, CocEngine, ConnectionParameterUpdate, L2capError, L2capPacket, L2capResult,
    LeCreditBasedConfig, SignalingChannel, SignalingMessage,
};
use crate::smp::{AuthData, Bond, PairingRole, SecurityLevel, SecurityManager, SmpError, SmpResult, SmpTransport};
use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How often the link thread checks the SMP timer
const LINK_TICK: Duration = Duration::from_millis(500);

/// Work handed from the dispatch loop to a link thread
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Acl(AclPacket),
    Encryption { status: u8, enabled: bool },
    LtkRequest { ediv: u16, rand: [u8; 8] },
}

/// Writes whole PDUs on one link
///
/// Also the Security Manager's transport, which keeps the SMP layer free
/// of any reference to the connection itself.
pub(crate) struct LinkWriter {
    handle: u16,
    ctx: Arc<LinkContext>,
    lock: Mutex<()>,
}

impl LinkWriter {
    fn write_pdu(&self, cid: u16, payload: &[u8]) -> L2capResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.ctx.write_pdu(self.handle, cid, payload)
    }
}

impl SmpTransport for LinkWriter {
    fn send(&self, pdu: &[u8]) -> SmpResult<()> {
        self.write_pdu(L2CAP_SMP_CID, pdu)
            .map_err(|err| SmpError::Transport(err.to_string()))
    }

    fn encrypt(&self, bond: &Bond) -> SmpResult<()> {
        self.ctx.defer(HciCommand::LeStartEncryption {
            handle: self.handle,
            rand: bond.rand,
            ediv: bond.ediv,
            ltk: bond.ltk,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct EncryptionState {
    enabled: bool,
    /// Status of the last failed Encryption Change
    failure: Option<u8>,
    closed: bool,
}

/// An established LE connection
pub struct Connection {
    handle: u16,
    role: Role,
    local: Address,
    peer: Address,
    params: Mutex<LinkParameters>,
    rx_mtu: AtomicU16,
    tx_mtu: AtomicU16,
    ctx: Arc<LinkContext>,
    writer: Arc<LinkWriter>,
    events: Sender<LinkEvent>,
    reads: Receiver<Vec<u8>>,
    read_tx: Mutex<Option<Sender<Vec<u8>>>>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    signaling: SignalingChannel,
    coc: CocEngine,
    coc_send: Mutex<()>,
    smp: SecurityManager,
    auth: Mutex<AuthData>,
    encryption: Mutex<EncryptionState>,
    encryption_changed: Condvar,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build the connection for a successful LE Connection Complete and
    /// start its link thread
    pub(crate) fn open(ctx: Arc<LinkContext>, complete: &LeConnectionComplete) -> Result<Arc<Self>> {
        let handle = complete.handle;
        let role = if complete.role == ROLE_CENTRAL {
            Role::Central
        } else {
            Role::Peripheral
        };
        let local = ctx.local_address();
        let peer = Address::new(complete.peer_address, AddressType::from_u8(complete.peer_address_type));

        let writer = Arc::new(LinkWriter {
            handle,
            ctx: ctx.clone(),
            lock: Mutex::new(()),
        });
        let pairing_role = match role {
            Role::Central => PairingRole::Initiator,
            Role::Peripheral => PairingRole::Responder,
        };
        let smp = SecurityManager::new(
            pairing_role,
            local,
            peer,
            ctx.config.pairing.clone(),
            writer.clone(),
            ctx.bonds(),
        )
        .with_timeout(ctx.config.pairing_timeout);

        let (events, inbound) = bounded(ctx.config.acl_queue_len.max(1));
        let (read_tx, reads) = bounded(ctx.config.read_queue_len.max(1));
        let (closed_tx, closed_rx) = bounded(0);

        ctx.pool.open(handle);
        let conn = Arc::new(Self {
            handle,
            role,
            local,
            peer,
            params: Mutex::new(LinkParameters {
                interval: complete.conn_interval,
                latency: complete.conn_latency,
                supervision_timeout: complete.supervision_timeout,
            }),
            rx_mtu: AtomicU16::new(L2CAP_LE_DEFAULT_MTU),
            tx_mtu: AtomicU16::new(L2CAP_LE_DEFAULT_MTU),
            coc: CocEngine::new(ctx.config.read_queue_len),
            ctx,
            writer,
            events,
            reads,
            read_tx: Mutex::new(Some(read_tx)),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
            signaling: SignalingChannel::new(),
            coc_send: Mutex::new(()),
            smp,
            auth: Mutex::new(AuthData::default()),
            encryption: Mutex::new(EncryptionState::default()),
            encryption_changed: Condvar::new(),
        });

        let link = conn.clone();
        std::thread::Builder::new()
            .name(format!("blehost-link-{:03x}", handle))
            .spawn(move || link.run(inbound))
            .map_err(|err| {
                conn.shutdown();
                Error::Hci(HciError::SocketError(err))
            })?;

        info!("connected to {} as {:?} (handle 0x{:04x})", peer, role, handle);
        Ok(conn)
    }

    // Accessors

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn local_address_type(&self) -> AddressType {
        self.local.kind
    }

    pub fn peer_address(&self) -> Address {
        self.peer
    }

    pub fn peer_address_type(&self) -> AddressType {
        self.peer.kind
    }

    pub fn parameters(&self) -> LinkParameters {
        *self.params.lock().unwrap()
    }

    /// Connection interval in 1.25 ms units
    pub fn interval(&self) -> u16 {
        self.parameters().interval
    }

    pub fn latency(&self) -> u16 {
        self.parameters().latency
    }

    /// Supervision timeout in 10 ms units
    pub fn supervision_timeout(&self) -> u16 {
        self.parameters().supervision_timeout
    }

    pub(crate) fn update_parameters(&self, params: LinkParameters) {
        debug!("0x{:04x}: parameters now {:?}", self.handle, params);
        *self.params.lock().unwrap() = params;
    }

    /// Largest ATT PDU we accept
    pub fn rx_mtu(&self) -> u16 {
        self.rx_mtu.load(Ordering::Relaxed)
    }

    pub fn set_rx_mtu(&self, mtu: u16) {
        self.rx_mtu.store(mtu.max(L2CAP_LE_DEFAULT_MTU), Ordering::Relaxed);
    }

    /// Largest ATT PDU the peer accepts
    pub fn tx_mtu(&self) -> u16 {
        self.tx_mtu.load(Ordering::Relaxed)
    }

    pub fn set_tx_mtu(&self, mtu: u16) {
        self.tx_mtu.store(mtu.max(L2CAP_LE_DEFAULT_MTU), Ordering::Relaxed);
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.lock().unwrap().enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed_tx.lock().unwrap().is_none()
    }

    /// Becomes disconnected once the link is gone
    pub fn disconnected(&self) -> Receiver<()> {
        self.closed_rx.clone()
    }

    // Data on the ATT channel

    /// Next ATT PDU; fails with `ConnectionTerminated` once the link is
    /// gone and the queue is drained
    pub fn read(&self) -> Result<Vec<u8>> {
        self.reads
            .recv()
            .map_err(|_| Error::L2cap(L2capError::ConnectionTerminated))
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self.reads.recv_timeout(timeout) {
            Ok(pdu) => Ok(pdu),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout { op: "read" }),
            Err(RecvTimeoutError::Disconnected) => Err(L2capError::ConnectionTerminated.into()),
        }
    }

    /// Send an SDU on the ATT channel, one PDU per `tx_mtu` bytes
    pub fn write(&self, sdu: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(L2capError::ConnectionTerminated.into());
        }
        let mtu = self.tx_mtu() as usize;
        for pdu in sdu.chunks(mtu) {
            self.writer.write_pdu(L2CAP_ATT_CID, pdu)?;
        }
        Ok(sdu.len())
    }

    /// Disconnect and wait for the controller to confirm
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let disconnected = self.disconnected();
        let command = HciCommand::Disconnect {
            handle: self.handle,
            reason: HCI_REMOTE_USER_TERMINATED,
        };
        match self.ctx.send(command) {
            Ok(_) => {}
            Err(HciError::CommandFailed {
                status: HCI_UNKNOWN_CONNECTION_ID,
                ..
            })
            | Err(HciError::Closed) => {
                self.shutdown();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        match disconnected.recv_timeout(self.ctx.config.command_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                self.shutdown();
                Err(Error::Timeout { op: "disconnect" })
            }
            _ => Ok(()),
        }
    }

    // Signaling requests

    fn send_signal(&self, message: &SignalingMessage) {
        if let Err(err) = self.writer.write_pdu(L2CAP_LE_SIGNALING_CID, &message.serialize()) {
            debug!("0x{:04x}: signaling write failed: {}", self.handle, err);
        }
    }

    fn reject(&self, identifier: SignalId, reason: u16, data: Vec<u8>) {
        self.send_signal(&SignalingMessage::CommandReject {
            identifier,
            reason,
            data,
        });
    }

    /// Send a signaling request and wait for its response
    fn request(
        &self,
        build: impl FnOnce(SignalId) -> SignalingMessage,
        timeout: Duration,
        what: &'static str,
    ) -> L2capResult<SignalingMessage> {
        if self.is_closed() {
            return Err(L2capError::ConnectionTerminated);
        }
        let (id, response) = self.signaling.begin()?;
        if let Err(err) = self.writer.write_pdu(L2CAP_LE_SIGNALING_CID, &build(id).serialize()) {
            self.signaling.cancel(id);
            return Err(err);
        }
        match response.recv_timeout(timeout) {
            Ok(SignalingMessage::CommandReject { reason, .. }) => Err(L2capError::CommandRejected(reason)),
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => {
                self.signaling.cancel(id);
                Err(L2capError::Timeout(what))
            }
            Err(RecvTimeoutError::Disconnected) => Err(L2capError::ConnectionTerminated),
        }
    }

    /// Ask the central for new connection parameters (peripheral only)
    pub fn request_parameter_update(&self, params: ConnectionParameterUpdate, timeout: Duration) -> Result<()> {
        if self.role != Role::Peripheral {
            return Err(L2capError::InvalidState.into());
        }
        if !params.validate() {
            return Err(Error::InvalidParameter(format!("connection parameters {:?}", params)));
        }
        let response = self.request(
            |identifier| SignalingMessage::ConnectionParameterUpdateRequest { identifier, params },
            timeout,
            "connection parameter update",
        )?;
        match response {
            SignalingMessage::ConnectionParameterUpdateResponse { result, .. } if result == L2CAP_CONN_PARAM_ACCEPTED => {
                Ok(())
            }
            SignalingMessage::ConnectionParameterUpdateResponse { .. } => {
                Err(L2capError::ParameterUpdateRejected.into())
            }
            other => Err(unexpected(&other).into()),
        }
    }

    // Credit based channels

    /// Open a credit based channel to `psm`
    ///
    /// `config` defaults to the session's channel configuration.
    pub fn coc_open(&self, psm: u16, config: Option<LeCreditBasedConfig>, timeout: Duration) -> Result<CocChannelInfo> {
        let config = config.unwrap_or(self.ctx.config.coc);
        config.validate()?;
        let local_cid = self.coc.allocate_cid()?;

        let response = self.request(
            |identifier| SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: psm,
                source_cid: local_cid,
                mtu: config.mtu,
                mps: config.mps,
                initial_credits: config.initial_credits,
            },
            timeout,
            "credit based connection",
        )?;

        let SignalingMessage::LeCreditBasedConnectionResponse {
            destination_cid,
            mtu,
            mps,
            initial_credits,
            result,
            ..
        } = response
        else {
            return Err(unexpected(&response).into());
        };
        if result != L2CAP_LE_CONN_SUCCESSFUL {
            return Err(L2capError::ConnectionRefused(result).into());
        }
        if !(L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&destination_cid) {
            return Err(L2capError::InvalidParameter(format!("peer CID 0x{:04x}", destination_cid)).into());
        }

        let info = CocChannelInfo {
            psm,
            local_cid,
            remote_cid: destination_cid,
            local_mtu: config.mtu,
            local_mps: config.mps,
            remote_mtu: mtu,
            remote_mps: mps,
            send_credits: initial_credits,
        };
        self.coc.register(info)?;
        Ok(info)
    }

    /// Send one SDU, spending one credit per K-frame
    pub fn coc_send(&self, local_cid: u16, sdu: &[u8]) -> Result<()> {
        let info = self.coc.info(local_cid)?;
        if sdu.len() > info.remote_mtu as usize {
            return Err(L2capError::MtuExceeded {
                size: sdu.len(),
                mtu: info.remote_mtu,
            }
            .into());
        }
        let frames = crate::l2cap::packet::segment_sdu(sdu, info.remote_mps)?;

        // One SDU at a time so frames of different SDUs never interleave
        let _sending = self.coc_send.lock().unwrap();
        for frame in frames {
            self.coc.acquire_credit(
                local_cid,
                self.ctx.config.coc_credit_attempts,
                self.ctx.config.coc_credit_backoff,
            )?;
            self.writer.write_pdu(info.remote_cid, &frame)?;
        }
        Ok(())
    }

    pub fn coc_subscribe(&self, local_cid: u16) -> Result<Receiver<Vec<u8>>> {
        Ok(self.coc.subscribe(local_cid)?)
    }

    pub fn coc_unsubscribe(&self, local_cid: u16) -> Result<()> {
        Ok(self.coc.unsubscribe(local_cid)?)
    }

    pub fn coc_info(&self, local_cid: u16) -> Result<CocChannelInfo> {
        Ok(self.coc.info(local_cid)?)
    }

    /// Disconnect a channel; it is unregistered even if the peer never answers
    pub fn coc_close(&self, local_cid: u16, timeout: Duration) -> Result<()> {
        let info = self.coc.info(local_cid)?;
        let outcome = self.request(
            |identifier| SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: info.remote_cid,
                source_cid: local_cid,
            },
            timeout,
            "channel disconnection",
        );
        if let Err(err) = outcome {
            warn!("0x{:04x}: CoC 0x{:04x} closed locally: {}", self.handle, local_cid, err);
        }
        // The peer may have disconnected the channel meanwhile
        match self.coc.remove(local_cid) {
            Ok(_) | Err(L2capError::ChannelNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // Security

    /// User interaction data for pairings the peer starts
    pub fn set_auth(&self, auth: AuthData) {
        *self.auth.lock().unwrap() = auth.clone();
        self.smp.set_auth(auth);
    }

    /// Pair with the peer and wait for the bond
    pub fn pair(&self, auth: AuthData, timeout: Duration) -> Result<Bond> {
        if self.is_closed() {
            return Err(L2capError::ConnectionTerminated.into());
        }
        *self.auth.lock().unwrap() = auth.clone();
        Ok(self.smp.pair(auth, timeout)?)
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.smp.security_level()
    }

    /// Encrypt the link with the stored bond
    ///
    /// Returns the current security level at once if the link is already
    /// encrypted. A central starts encryption itself; a peripheral sends a
    /// Security Request and waits for the central to encrypt or pair.
    pub fn start_encryption(&self, timeout: Duration) -> Result<SecurityLevel> {
        {
            let mut state = self.encryption.lock().unwrap();
            if state.closed {
                return Err(L2capError::ConnectionTerminated.into());
            }
            if state.enabled {
                return Ok(self.smp.security_level());
            }
            state.failure = None;
        }

        match self.role {
            Role::Central => {
                let bond = self.smp.bond().ok_or(SmpError::NotPaired)?;
                self.ctx.send(HciCommand::LeStartEncryption {
                    handle: self.handle,
                    rand: bond.rand,
                    ediv: bond.ediv,
                    ltk: bond.ltk,
                })?;
                self.wait_encrypted(timeout)?;
            }
            Role::Peripheral => {
                let auth = self.auth.lock().unwrap().clone();
                let outcome = self.smp.initiate(auth)?;
                match outcome.recv_timeout(timeout) {
                    Ok(result) => {
                        result?;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        self.smp.abort(SmpError::Timeout);
                        return Err(Error::Timeout { op: "start encryption" });
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(L2capError::ConnectionTerminated.into()),
                }
            }
        }
        Ok(self.smp.security_level())
    }

    fn wait_encrypted(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.encryption.lock().unwrap();
        loop {
            if state.enabled {
                return Ok(());
            }
            if let Some(status) = state.failure.take() {
                return Err(SmpError::EncryptionFailed(status).into());
            }
            if state.closed {
                return Err(L2capError::ConnectionTerminated.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout { op: "start encryption" });
            }
            state = self.encryption_changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    // Dispatch loop side

    /// Queue work for the link thread; false if the queue stayed full
    pub(crate) fn deliver(&self, event: LinkEvent) -> bool {
        self.events.send_timeout(event, self.ctx.config.acl_queue_timeout).is_ok()
    }

    /// Tear the link down locally; returns false if it already was
    pub(crate) fn shutdown(&self) -> bool {
        let Some(closed) = self.closed_tx.lock().unwrap().take() else {
            return false;
        };
        drop(closed);
        self.read_tx.lock().unwrap().take();
        self.ctx.pool.reclaim(self.handle);
        self.coc.close_all();
        self.signaling.close();
        self.smp.close();
        {
            let mut state = self.encryption.lock().unwrap();
            state.enabled = false;
            state.closed = true;
            self.encryption_changed.notify_all();
        }
        true
    }

    /// Controller reported the link gone
    pub(crate) fn teardown(&self, reason: u8) {
        if self.shutdown() {
            info!("disconnected from {} (handle 0x{:04x}, reason 0x{:02x})", self.peer, self.handle, reason);
        }
    }

    /// Drop a link nobody wants, without waiting for the controller
    pub(crate) fn abandon(&self) {
        self.ctx.defer(HciCommand::Disconnect {
            handle: self.handle,
            reason: HCI_REMOTE_USER_TERMINATED,
        });
        self.shutdown();
    }

    /// Abandon the link after a local failure
    pub(crate) fn fail(&self, err: Error) {
        self.ctx.handlers.report(&err);
        self.abandon();
    }

    // Link thread

    fn run(self: Arc<Self>, inbound: Receiver<LinkEvent>) {
        let mut reassembler = Reassembler::new(self.handle);
        let ticker = tick(LINK_TICK);
        loop {
            select! {
                recv(inbound) -> event => match event {
                    Ok(event) => {
                        if let Err(err) = self.on_event(&mut reassembler, event) {
                            self.fail(err.into());
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.closed_rx) -> _ => break,
                recv(ticker) -> _ => self.smp.poll_timeout(),
            }
        }
        debug!("link thread for 0x{:04x} exiting", self.handle);
    }

    fn on_event(&self, reassembler: &mut Reassembler, event: LinkEvent) -> L2capResult<()> {
        match event {
            LinkEvent::Acl(packet) => {
                if let Some(pdu) = reassembler.push(&packet)? {
                    self.on_pdu(pdu);
                }
            }
            LinkEvent::Encryption { status, enabled } => self.on_encryption(status, enabled),
            LinkEvent::LtkRequest { ediv, rand } => self.on_ltk_request(ediv, rand),
        }
        Ok(())
    }

    fn on_pdu(&self, pdu: L2capPacket) {
        trace!("0x{:04x}: {} byte PDU on CID 0x{:04x}", self.handle, pdu.payload.len(), pdu.channel_id);
        match pdu.channel_id {
            L2CAP_ATT_CID => self.on_att(pdu.payload),
            L2CAP_LE_SIGNALING_CID => self.on_signaling(&pdu.payload),
            L2CAP_SMP_CID => {
                if let Err(err) = self.smp.handle_pdu(&pdu.payload) {
                    debug!("0x{:04x}: {}", self.handle, err);
                }
            }
            cid if (L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&cid) => {
                self.on_k_frame(cid, &pdu.payload)
            }
            cid => debug!("0x{:04x}: dropping PDU for CID 0x{:04x}", self.handle, cid),
        }
    }

    fn on_att(&self, pdu: Vec<u8>) {
        let reader = self.read_tx.lock().unwrap().clone();
        if let Some(reader) = reader {
            if reader.send_timeout(pdu, self.ctx.config.coc_deliver_timeout).is_err() {
                warn!("0x{:04x}: reader stalled, ATT PDU dropped", self.handle);
            }
        }
    }

    fn on_encryption(&self, status: u8, enabled: bool) {
        self.smp.on_encrypted(status, enabled);
        let mut state = self.encryption.lock().unwrap();
        if status == HCI_SUCCESS {
            state.enabled = enabled;
            state.failure = None;
        } else {
            state.failure = Some(status);
        }
        self.encryption_changed.notify_all();
    }

    fn on_ltk_request(&self, ediv: u16, rand: [u8; 8]) {
        let command = match self.smp.long_term_key(ediv, &rand) {
            Some(ltk) => HciCommand::LeLongTermKeyRequestReply {
                handle: self.handle,
                ltk,
            },
            None => {
                debug!("0x{:04x}: no key for EDIV 0x{:04x}", self.handle, ediv);
                HciCommand::LeLongTermKeyRequestNegativeReply { handle: self.handle }
            }
        };
        self.ctx.defer(command);
    }

    fn on_signaling(&self, data: &[u8]) {
        let message = match SignalingMessage::parse(data) {
            Ok(message) => message,
            Err(err) => {
                debug!("0x{:04x}: rejecting signaling command: {}", self.handle, err);
                if let Some(header) = L2capCommandHeader::parse(data) {
                    self.reject(header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                }
                return;
            }
        };

        if message.is_response() {
            if !self.signaling.complete(message) {
                debug!("0x{:04x}: unsolicited signaling response", self.handle);
            }
            return;
        }

        match message {
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } => {
                self.on_parameter_update_request(identifier, params)
            }
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier, le_psm, ..
            } => {
                debug!("0x{:04x}: refusing channel on PSM 0x{:04x}", self.handle, le_psm);
                self.send_signal(&SignalingMessage::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: 0,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result: L2CAP_LE_CONN_PSM_NOT_SUPPORTED,
                });
            }
            SignalingMessage::LeFlowControlCredit { cid, credits, .. } => match self.coc.grant(cid, credits) {
                Ok(total) => trace!("0x{:04x}: CID 0x{:04x} has {} credits", self.handle, cid, total),
                Err(err) => debug!("0x{:04x}: {}", self.handle, err),
            },
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let known = self
                    .coc
                    .info(destination_cid)
                    .map(|info| info.remote_cid == source_cid)
                    .unwrap_or(false);
                if known && self.coc.remove(destination_cid).is_ok() {
                    self.send_signal(&SignalingMessage::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    });
                } else {
                    let mut data = destination_cid.to_le_bytes().to_vec();
                    data.extend_from_slice(&source_cid.to_le_bytes());
                    self.reject(identifier, L2CAP_REJECT_INVALID_CID, data);
                }
            }
            other => self.reject(other.identifier(), L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new()),
        }
    }

    fn on_parameter_update_request(&self, identifier: SignalId, params: ConnectionParameterUpdate) {
        // Only the central answers this request
        if self.role != Role::Central {
            self.reject(identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        }
        let accepted = params.validate();
        let result = if accepted {
            L2CAP_CONN_PARAM_ACCEPTED
        } else {
            L2CAP_CONN_PARAM_REJECTED
        };
        self.send_signal(&SignalingMessage::ConnectionParameterUpdateResponse { identifier, result });
        if accepted {
            self.ctx.defer(HciCommand::LeConnectionUpdate {
                handle: self.handle,
                params: ConnectionParameters {
                    conn_interval_min: params.conn_interval_min,
                    conn_interval_max: params.conn_interval_max,
                    conn_latency: params.conn_latency,
                    supervision_timeout: params.supervision_timeout,
                    ..self.ctx.config.connection
                },
            });
        }
    }

    fn on_k_frame(&self, cid: u16, frame: &[u8]) {
        let received = match self.coc.receive(cid, frame) {
            Ok(received) => received,
            Err(err) => {
                warn!("0x{:04x}: {}", self.handle, err);
                return;
            }
        };

        self.send_signal(&SignalingMessage::LeFlowControlCredit {
            identifier: self.signaling.next_identifier(),
            cid: received.local_cid,
            credits: 1,
        });

        match received.sdu {
            Some((sdu, Some(subscriber))) => {
                if subscriber.send_timeout(sdu, self.ctx.config.coc_deliver_timeout).is_err() {
                    warn!("0x{:04x}: CoC 0x{:04x} subscriber stalled, SDU dropped", self.handle, cid);
                }
            }
            Some((sdu, None)) => {
                debug!("0x{:04x}: CoC 0x{:04x} has no subscriber, {} bytes dropped", self.handle, cid, sdu.len())
            }
            None => {}
        }
    }
}

fn unexpected(message: &SignalingMessage) -> L2capError {
    L2capError::InvalidParameter(format!("unexpected signaling response 0x{:02x}", message.command_code()))
}
