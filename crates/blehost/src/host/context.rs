//! Services a connection borrows from its session
//!
//! Connections hold an `Arc<LinkContext>` rather than a reference to the
//! session, so the connection table is the only owner of connections and
//! nothing points back at it.

use super::command::{CommandEngine, CommandResponse};
use crate::address::Address;
use crate::config::Config;
use crate::conn::pool::AclPool;
use crate::conn::recombine::fragment;
use crate::error::{Error, HciError};
use crate::hci::event::LeAdvertisingReport;
use crate::hci::HciCommand;
use crate::l2cap::{L2capError, L2capPacket, L2capResult};
use crate::smp::BondStore;
use crossbeam_channel::{Sender, TrySendError};
use log::{trace, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// An advertising report delivered to the advertisement handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: Address,
    /// Advertising event type (ADV_IND, SCAN_RSP, ...)
    pub event_type: u8,
    /// Raw AD structures
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl From<LeAdvertisingReport> for Advertisement {
    fn from(report: LeAdvertisingReport) -> Self {
        Self {
            address: Address::new(report.address, crate::address::AddressType::from_u8(report.address_type)),
            event_type: report.event_type,
            data: report.data,
            rssi: report.rssi,
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
pub type AdvertisementHandler = Arc<dyn Fn(&Advertisement) + Send + Sync>;

/// User callbacks for asynchronous happenings
#[derive(Default)]
pub(crate) struct Handlers {
    error: RwLock<Option<ErrorHandler>>,
    advertisement: RwLock<Option<AdvertisementHandler>>,
}

impl Handlers {
    pub fn set_error(&self, handler: ErrorHandler) {
        *self.error.write().unwrap() = Some(handler);
    }

    pub fn set_advertisement(&self, handler: AdvertisementHandler) {
        *self.advertisement.write().unwrap() = Some(handler);
    }

    /// Single sink for errors nobody is waiting on
    pub fn report(&self, err: &Error) {
        warn!("{}", err);
        let handler = self.error.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    pub fn advertisement(&self, adv: &Advertisement) {
        let handler = self.advertisement.read().unwrap().clone();
        match handler {
            Some(handler) => handler(adv),
            None => trace!("advertisement from {} with no handler", adv.address),
        }
    }
}

pub(crate) struct LinkContext {
    pub config: Config,
    pub engine: CommandEngine,
    pub pool: AclPool,
    pub handlers: Handlers,
    acl_mtu: AtomicUsize,
    deferred: Sender<HciCommand>,
    bonds: RwLock<Arc<dyn BondStore>>,
    local: RwLock<Address>,
}

impl LinkContext {
    pub fn new(
        config: Config,
        engine: CommandEngine,
        deferred: Sender<HciCommand>,
        bonds: Arc<dyn BondStore>,
    ) -> Self {
        Self {
            pool: AclPool::new(config.acl_pool_fallback),
            acl_mtu: AtomicUsize::new(config.acl_mtu_fallback),
            config,
            engine,
            handlers: Handlers::default(),
            deferred,
            bonds: RwLock::new(bonds),
            local: RwLock::new(Address::default()),
        }
    }

    pub fn send(&self, command: HciCommand) -> Result<CommandResponse, HciError> {
        self.engine.send(&command)
    }

    /// Queue a command for the deferred worker
    ///
    /// Used from the dispatch and link threads, which must never wait on a
    /// Command Complete they are themselves responsible for delivering.
    pub fn defer(&self, command: HciCommand) {
        match self.deferred.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                self.handlers.report(&Error::Busy("deferred command queue"));
                warn!("dropped deferred command 0x{:04x}", command.opcode());
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn acl_mtu(&self) -> usize {
        self.acl_mtu.load(Ordering::Relaxed)
    }

    pub fn set_acl_mtu(&self, mtu: usize) {
        self.acl_mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn bonds(&self) -> Arc<dyn BondStore> {
        self.bonds.read().unwrap().clone()
    }

    pub fn set_bonds(&self, store: Arc<dyn BondStore>) {
        *self.bonds.write().unwrap() = store;
    }

    pub fn local_address(&self) -> Address {
        *self.local.read().unwrap()
    }

    pub fn set_local_address(&self, address: Address) {
        *self.local.write().unwrap() = address;
    }

    /// Write one L2CAP PDU to `handle`, one pool buffer per ACL fragment
    ///
    /// Buffers for the whole PDU, or for as much of it as the pool can ever
    /// hold, are reserved before the start fragment goes out, so a timeout
    /// never leaves a partial PDU on the link. Fragments past that point
    /// wait for completions until the link goes away. The caller
    /// serialises PDUs of the same link so fragments never interleave.
    pub fn write_pdu(&self, handle: u16, cid: u16, payload: &[u8]) -> L2capResult<()> {
        let pdu = L2capPacket::new(cid, payload.to_vec()).to_bytes();
        let fragments = fragment(handle, &pdu, self.acl_mtu());
        let mut reserved = self
            .pool
            .acquire_n(handle, fragments.len(), Some(self.config.acl_buffer_timeout))?;
        for (sent, acl) in fragments.iter().enumerate() {
            if reserved == 0 {
                reserved = self.pool.acquire_n(handle, fragments.len() - sent, None)?;
            }
            if let Err(err) = self.engine.write_packet(&acl.to_packet()) {
                self.pool.release(handle, reserved);
                return Err(L2capError::Hci(err));
            }
            reserved -= 1;
        }
        trace!("0x{:04x}: {} byte PDU on CID 0x{:04x}", handle, payload.len(), cid);
        Ok(())
    }
}
