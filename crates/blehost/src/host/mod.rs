//! Controller session
//!
//! A [`Session`] owns one controller transport. Opening it starts three
//! threads (transport read loop, event dispatch loop and a worker for
//! commands issued from inside the dispatch path) and initialises the
//! controller. Closing it, or losing the transport, tears down every
//! connection and unblocks every waiter with a terminal error.

pub(crate) mod command;
pub(crate) mod context;
mod router;
#[cfg(test)]
mod tests;

pub use self::command::CommandResponse;
pub use self::context::{Advertisement, AdvertisementHandler, ErrorHandler};

use self::command::CommandEngine;
use self::context::LinkContext;
use crate::address::Address;
use crate::config::Config;
use crate::conn::table::ConnectionTable;
use crate::conn::Connection;
use crate::error::{Error, HciError, Result};
use crate::hci::constants::*;
use crate::hci::{AdvertisingParameters, HciCommand, ScanParameters};
use crate::smp::{BondStore, MemoryBondStore};
use crate::transport::Transport;
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Commands queued for the deferred worker
const DEFERRED_QUEUE_LEN: usize = 32;

/// Largest advertising or scan response payload
const MAX_ADV_DATA_LEN: usize = 31;

#[derive(Debug, Default)]
struct Advertising {
    /// Advertising was requested and not stopped; re-armed after a
    /// peripheral link ends
    enabled: bool,
}

type DialWaiter = Sender<Result<Arc<Connection>>>;

pub(crate) struct Shared {
    ctx: Arc<LinkContext>,
    transport: Arc<dyn Transport>,
    connections: ConnectionTable,
    done_tx: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    closed: AtomicBool,
    dial: Mutex<Option<DialWaiter>>,
    accept: (Sender<Arc<Connection>>, Receiver<Arc<Connection>>),
    advertising: Mutex<Advertising>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing session");

        for conn in self.connections.drain() {
            // Best effort; the transport may already be gone
            let _ = self.ctx.engine.post(&HciCommand::Disconnect {
                handle: conn.handle(),
                reason: HCI_REMOTE_USER_TERMINATED,
            });
            conn.teardown(HCI_LOCAL_HOST_TERMINATED);
        }

        self.done_tx.lock().unwrap().take();
        self.dial.lock().unwrap().take();
        self.ctx.engine.close();
        self.ctx.pool.close();
        self.transport.close();

        let current = thread::current().id();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// A host stack session over one controller
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Start the session threads and initialise the controller
    pub fn open(transport: Arc<dyn Transport>, config: Config) -> Result<Self> {
        let (done_tx, done) = bounded::<()>(0);
        let (deferred_tx, deferred_rx) = bounded(DEFERRED_QUEUE_LEN);
        let (packets_tx, packets_rx) = bounded(config.packet_queue_len.max(1));
        let accept = bounded(config.accept_queue_len.max(1));

        let engine = CommandEngine::new(
            transport.clone(),
            done.clone(),
            config.command_timeout,
            config.credit_timeout,
            config.opcode_lock_timeout,
        );
        let ctx = Arc::new(LinkContext::new(
            config,
            engine,
            deferred_tx,
            Arc::new(MemoryBondStore::new()),
        ));

        let session = Self {
            shared: Arc::new(Shared {
                ctx,
                transport,
                connections: ConnectionTable::default(),
                done_tx: Mutex::new(Some(done_tx)),
                done,
                closed: AtomicBool::new(false),
                dial: Mutex::new(None),
                accept,
                advertising: Mutex::new(Advertising::default()),
                threads: Mutex::new(Vec::new()),
            }),
        };

        let started = session
            .spawn("blehost-read", move |shared| router::read_loop(shared, packets_tx))
            .and_then(|_| session.spawn("blehost-dispatch", move |shared| router::dispatch_loop(shared, packets_rx)))
            .and_then(|_| session.spawn("blehost-deferred", move |shared| router::deferred_loop(shared, deferred_rx)))
            .and_then(|_| session.initialize());
        if let Err(err) = started {
            session.close();
            return Err(err);
        }
        Ok(session)
    }

    fn spawn(&self, name: &str, run: impl FnOnce(Arc<Shared>) + Send + 'static) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(shared))
            .map_err(HciError::SocketError)?;
        self.shared.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn initialize(&self) -> Result<()> {
        self.send(HciCommand::Reset)?;

        let bd_addr = self.send(HciCommand::ReadBdAddr)?;
        if let Some(bytes) = bd_addr.payload().get(..6) {
            let mut address = [0u8; 6];
            address.copy_from_slice(bytes);
            self.shared.ctx.set_local_address(Address::public(address));
        }

        let (mtu, buffers) = self.read_buffer_size();
        self.shared.ctx.set_acl_mtu(mtu);
        self.shared.ctx.pool.resize(buffers);

        self.send(HciCommand::SetEventMask {
            event_mask: DEFAULT_EVENT_MASK,
        })?;
        self.send(HciCommand::LeSetEventMask {
            event_mask: DEFAULT_LE_EVENT_MASK,
        })?;

        info!(
            "controller {} ready: {} ACL buffers of {} bytes",
            self.local_address(),
            buffers,
            mtu
        );
        Ok(())
    }

    /// ACL payload size and buffer count, LE buffers first
    fn read_buffer_size(&self) -> (usize, usize) {
        if let Ok(response) = self.send(HciCommand::LeReadBufferSize) {
            let p = response.payload();
            if p.len() >= 3 {
                let (len, num) = (LittleEndian::read_u16(&p[0..2]) as usize, p[2] as usize);
                if len > 0 && num > 0 {
                    return (len, num);
                }
            }
        }
        debug!("no dedicated LE buffers, using shared ACL buffers");
        if let Ok(response) = self.send(HciCommand::ReadBufferSize) {
            let p = response.payload();
            if p.len() >= 5 {
                let (len, num) = (LittleEndian::read_u16(&p[0..2]) as usize, LittleEndian::read_u16(&p[3..5]) as usize);
                if len > 0 && num > 0 {
                    return (len, num);
                }
            }
        }
        let config = &self.shared.ctx.config;
        (config.acl_mtu_fallback, config.acl_pool_fallback)
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Stop the session; idempotent
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn config(&self) -> &Config {
        &self.shared.ctx.config
    }

    /// Send a raw command and wait for its answer
    pub fn send(&self, command: HciCommand) -> Result<CommandResponse> {
        self.check_open()?;
        Ok(self.shared.ctx.send(command)?)
    }

    pub fn local_address(&self) -> Address {
        self.shared.ctx.local_address()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.all()
    }

    pub fn connection(&self, handle: u16) -> Option<Arc<Connection>> {
        self.shared.connections.get(handle)
    }

    /// Connect to `peer` as central
    ///
    /// `timeout` defaults to the configured dial timeout. When it expires
    /// the attempt is cancelled and a connection completing afterwards is
    /// closed rather than leaked.
    pub fn dial(&self, peer: Address, timeout: Option<Duration>) -> Result<Arc<Connection>> {
        self.check_open()?;
        let ctx = &self.shared.ctx;
        let timeout = timeout.unwrap_or(ctx.config.dial_timeout);

        let (tx, rx) = bounded(1);
        {
            let mut slot = self.shared.dial.lock().unwrap();
            if slot.is_some() {
                return Err(Error::Busy("dial"));
            }
            *slot = Some(tx);
        }

        let command = HciCommand::LeCreateConnection {
            peer_addr: peer.bytes,
            peer_addr_type: peer.kind.to_u8(),
            own_addr_type: self.local_address().kind.to_u8(),
            params: ctx.config.connection,
        };
        if let Err(err) = ctx.send(command) {
            self.shared.dial.lock().unwrap().take();
            return Err(err.into());
        }
        debug!("dialing {}", peer);

        select! {
            recv(rx) -> outcome => outcome.unwrap_or(Err(Error::Closed)),
            recv(self.shared.done) -> _ => Err(Error::Closed),
            default(timeout) => {
                self.shared.dial.lock().unwrap().take();
                if let Err(err) = ctx.send(HciCommand::LeCreateConnectionCancel) {
                    debug!("connection cancel: {}", err);
                }
                if let Ok(Ok(late)) = rx.try_recv() {
                    late.abandon();
                }
                Err(Error::DialTimeout)
            }
        }
    }

    /// Wait for a peripheral-role connection
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Arc<Connection>> {
        self.check_open()?;
        let incoming = &self.shared.accept.1;
        let accepted = match timeout {
            Some(timeout) => select! {
                recv(incoming) -> conn => conn.ok(),
                recv(self.shared.done) -> _ => None,
                default(timeout) => return Err(Error::Timeout { op: "accept" }),
            },
            None => select! {
                recv(incoming) -> conn => conn.ok(),
                recv(self.shared.done) -> _ => None,
            },
        };
        accepted.ok_or(Error::Closed)
    }

    /// Set advertising and scan response payloads (raw AD structures)
    pub fn set_advertising_data(&self, adv: &[u8], scan_rsp: &[u8]) -> Result<()> {
        if adv.len() > MAX_ADV_DATA_LEN || scan_rsp.len() > MAX_ADV_DATA_LEN {
            return Err(Error::InvalidParameter(format!(
                "advertising data of {} and {} bytes exceeds {}",
                adv.len(),
                scan_rsp.len(),
                MAX_ADV_DATA_LEN
            )));
        }
        self.send(HciCommand::LeSetAdvertisingData { data: adv.to_vec() })?;
        self.send(HciCommand::LeSetScanResponseData {
            data: scan_rsp.to_vec(),
        })?;
        Ok(())
    }

    pub fn start_advertising(&self, params: Option<AdvertisingParameters>) -> Result<()> {
        let params = params.unwrap_or(self.shared.ctx.config.advertising);
        self.send(HciCommand::LeSetAdvertisingParameters(params))?;
        self.send(HciCommand::LeSetAdvertisingEnable { enable: true })?;
        self.shared.advertising.lock().unwrap().enabled = true;
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<()> {
        self.shared.advertising.lock().unwrap().enabled = false;
        self.send(HciCommand::LeSetAdvertisingEnable { enable: false })?;
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.shared.advertising.lock().unwrap().enabled
    }

    pub fn start_scan(&self, params: Option<ScanParameters>) -> Result<()> {
        let params = params.unwrap_or(self.shared.ctx.config.scan);
        self.send(HciCommand::LeSetScanParameters {
            scan_type: params.scan_type,
            scan_interval: params.scan_interval,
            scan_window: params.scan_window,
            own_address_type: params.own_address_type,
            filter_policy: params.filter_policy,
        })?;
        self.send(HciCommand::LeSetScanEnable {
            enable: true,
            filter_duplicates: params.filter_duplicates,
        })?;
        Ok(())
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(HciCommand::LeSetScanEnable {
            enable: false,
            filter_duplicates: false,
        })?;
        Ok(())
    }

    /// Called on the dispatch thread for every advertising report
    pub fn set_advertisement_handler(&self, handler: impl Fn(&Advertisement) + Send + Sync + 'static) {
        self.shared.ctx.handlers.set_advertisement(Arc::new(handler));
    }

    /// Called for errors no caller is waiting on
    pub fn set_error_handler(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared.ctx.handlers.set_error(Arc::new(handler));
    }

    /// Bond storage for connections established from now on
    pub fn set_bond_store(&self, store: Arc<dyn BondStore>) {
        self.shared.ctx.set_bonds(store);
    }

    pub fn bond_store(&self) -> Arc<dyn BondStore> {
        self.shared.ctx.bonds()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local_address())
            .field("connections", &self.shared.connections.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
