//! Session threads: transport read loop, event dispatch, deferred commands
//!
//! The read loop only frames packets; everything else happens on the
//! dispatch loop so events are handled in arrival order. Per-connection
//! work is handed on to link threads.

use super::Shared;
use crate::conn::connection::{Connection, LinkEvent};
use crate::conn::{LinkParameters, Role};
use crate::error::{Error, HciError};
use crate::hci::constants::*;
use crate::hci::event::*;
use crate::hci::{AclPacket, HciCommand, HciEvent};
use crate::transport::{self, PacketReader};
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, error, trace, warn};
use std::sync::Arc;

const READ_CHUNK: usize = 1024;

pub(crate) fn read_loop(shared: Arc<Shared>, packets: Sender<Vec<u8>>) {
    let mut reader = PacketReader::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let failure = loop {
        if shared.is_closed() {
            break None;
        }
        match shared.transport.read(&mut buf) {
            Ok(0) => break Some(HciError::Eof),
            Ok(n) => {
                reader.push(&buf[..n]);
                loop {
                    match reader.next_packet() {
                        Ok(Some(packet)) => {
                            select! {
                                send(packets, packet) -> sent => if sent.is_err() { return },
                                recv(shared.done) -> _ => return,
                            }
                        }
                        Ok(None) => break,
                        Err(err) => shared.ctx.handlers.report(&err.into()),
                    }
                }
            }
            Err(err) if transport::is_idle(&err) => continue,
            Err(err) => break Some(HciError::ReceiveError(err)),
        }
    };

    if let Some(err) = failure {
        if !shared.is_closed() {
            error!("transport failed: {}", err);
            shared.ctx.handlers.report(&err.into());
            shared.close();
        }
    }
    debug!("read loop exiting");
}

pub(crate) fn dispatch_loop(shared: Arc<Shared>, packets: Receiver<Vec<u8>>) {
    loop {
        select! {
            recv(packets) -> packet => match packet {
                Ok(packet) => shared.dispatch(&packet),
                Err(_) => break,
            },
            recv(shared.done) -> _ => break,
        }
    }
    debug!("dispatch loop exiting");
}

/// Runs commands issued from threads that must not block on the answer
pub(crate) fn deferred_loop(shared: Arc<Shared>, commands: Receiver<HciCommand>) {
    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(command) => match shared.ctx.send(command) {
                    Ok(_) => {}
                    Err(HciError::Closed) => break,
                    Err(err) => shared.ctx.handlers.report(&err.into()),
                },
                Err(_) => break,
            },
            recv(shared.done) -> _ => break,
        }
    }
    debug!("deferred command worker exiting");
}

impl Shared {
    fn dispatch(&self, packet: &[u8]) {
        let Some((&kind, body)) = packet.split_first() else {
            return;
        };
        match kind {
            HCI_EVENT_PKT => match HciEvent::parse(body) {
                Some(event) => self.on_event(event),
                None => self.ctx.handlers.report(&Error::MalformedEvent {
                    code: body.first().copied().unwrap_or(0),
                }),
            },
            HCI_ACL_PKT => match AclPacket::parse(body) {
                Some(acl) => self.to_link(acl.header.handle, LinkEvent::Acl(acl)),
                None => warn!("malformed ACL packet dropped"),
            },
            other => debug!("ignoring packet type 0x{:02x}", other),
        }
    }

    fn on_event(&self, event: HciEvent) {
        let code = event.event_code;
        let params = &event.parameters;
        trace!("event 0x{:02x} ({} bytes)", code, params.len());

        let handled = match code {
            EVT_CMD_COMPLETE => CommandComplete::parse(params).map(|e| self.ctx.engine.on_command_complete(e)),
            EVT_CMD_STATUS => CommandStatus::parse(params).map(|e| self.ctx.engine.on_command_status(e)),
            EVT_DISCONN_COMPLETE => DisconnectionComplete::parse(params).map(|e| self.on_disconnection(e)),
            EVT_ENCRYPTION_CHANGE => EncryptionChange::parse(params).map(|e| {
                self.to_link(
                    e.handle,
                    LinkEvent::Encryption {
                        status: e.status,
                        enabled: e.enabled,
                    },
                )
            }),
            EVT_ENCRYPTION_KEY_REFRESH => EncryptionKeyRefresh::parse(params).map(|e| {
                self.to_link(
                    e.handle,
                    LinkEvent::Encryption {
                        status: e.status,
                        enabled: true,
                    },
                )
            }),
            EVT_NUM_COMP_PKTS => NumberOfCompletedPackets::parse(params).map(|e| {
                for (handle, count) in e.completed {
                    self.ctx.pool.release(handle, count as usize);
                }
            }),
            EVT_HARDWARE_ERROR => params
                .first()
                .map(|&hw| self.ctx.handlers.report(&Error::HardwareError(hw))),
            EVT_DATA_BUFFER_OVERFLOW => {
                warn!("controller reported ACL buffer overflow");
                Some(())
            }
            EVT_LE_META_EVENT => self.on_le_meta(params),
            EVT_VENDOR => {
                self.ctx.handlers.report(&Error::VendorEvent(params.clone()));
                Some(())
            }
            other => {
                debug!("unhandled event 0x{:02x}", other);
                Some(())
            }
        };

        if handled.is_none() {
            self.ctx.handlers.report(&Error::MalformedEvent { code });
        }
    }

    fn on_le_meta(&self, params: &[u8]) -> Option<()> {
        match *params.first()? {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENHANCED_CONN_COMPLETE => {
                LeConnectionComplete::parse(params).map(|e| self.on_connection_complete(e))
            }
            EVT_LE_ADVERTISING_REPORT => LeAdvertisingReport::parse_all(params).map(|reports| {
                for report in reports {
                    self.ctx.handlers.advertisement(&report.into());
                }
            }),
            EVT_LE_CONN_UPDATE_COMPLETE => LeConnectionUpdateComplete::parse(params).map(|e| {
                if e.status != HCI_SUCCESS {
                    debug!("connection update on 0x{:04x} failed: 0x{:02x}", e.handle, e.status);
                } else if let Some(conn) = self.connections.get(e.handle) {
                    conn.update_parameters(LinkParameters {
                        interval: e.conn_interval,
                        latency: e.conn_latency,
                        supervision_timeout: e.supervision_timeout,
                    });
                }
            }),
            EVT_LE_LTK_REQUEST => LeLongTermKeyRequest::parse(params).map(|e| {
                if self.connections.get(e.handle).is_some() {
                    self.to_link(
                        e.handle,
                        LinkEvent::LtkRequest {
                            ediv: e.ediv,
                            rand: e.rand,
                        },
                    );
                } else {
                    self.ctx
                        .defer(HciCommand::LeLongTermKeyRequestNegativeReply { handle: e.handle });
                }
            }),
            other => {
                trace!("unhandled LE sub-event 0x{:02x}", other);
                Some(())
            }
        }
    }

    /// Hand work to a connection's link thread
    fn to_link(&self, handle: u16, event: LinkEvent) {
        let Some(conn) = self.connections.get(handle) else {
            debug!("dropping data for unknown handle 0x{:04x}", handle);
            return;
        };
        if !conn.deliver(event) {
            conn.fail(Error::Busy("connection queue"));
        }
    }

    fn on_connection_complete(&self, event: LeConnectionComplete) {
        if event.status != HCI_SUCCESS {
            debug!("connection attempt ended with status 0x{:02x}", event.status);
            if let Some(waiter) = self.dial.lock().unwrap().take() {
                let _ = waiter.try_send(Err(HciError::CommandFailed {
                    opcode: OP_LE_CREATE_CONNECTION,
                    status: event.status,
                }
                .into()));
            }
            return;
        }

        let conn = match Connection::open(self.ctx.clone(), &event) {
            Ok(conn) => conn,
            Err(err) => {
                self.ctx.handlers.report(&err);
                self.ctx.defer(HciCommand::Disconnect {
                    handle: event.handle,
                    reason: HCI_REMOTE_USER_TERMINATED,
                });
                return;
            }
        };
        if let Some(stale) = self.connections.insert(conn.clone()) {
            warn!("handle 0x{:04x} reused while still registered", stale.handle());
            stale.teardown(HCI_LOCAL_HOST_TERMINATED);
        }

        match conn.role() {
            Role::Central => {
                let waiter = self.dial.lock().unwrap().take();
                let delivered = waiter.map(|w| w.try_send(Ok(conn.clone())).is_ok()).unwrap_or(false);
                if !delivered {
                    debug!("nobody dialing 0x{:04x}, disconnecting", conn.handle());
                    conn.abandon();
                }
            }
            Role::Peripheral => {
                if self.accept.0.try_send(conn.clone()).is_err() {
                    warn!("accept queue full, disconnecting 0x{:04x}", conn.handle());
                    conn.abandon();
                }
            }
        }
    }

    fn on_disconnection(&self, event: DisconnectionComplete) {
        if event.status != HCI_SUCCESS {
            debug!("disconnect of 0x{:04x} failed: 0x{:02x}", event.handle, event.status);
            return;
        }
        match self.connections.remove(event.handle) {
            Some(conn) => {
                conn.teardown(event.reason);
                if conn.role() == Role::Peripheral {
                    self.rearm_advertising();
                }
            }
            None => {
                self.ctx.pool.reclaim(event.handle);
                debug!("disconnection for unknown handle 0x{:04x}", event.handle);
            }
        }
    }

    fn rearm_advertising(&self) {
        if self.advertising.lock().unwrap().enabled {
            debug!("re-enabling advertising");
            self.ctx.defer(HciCommand::LeSetAdvertisingEnable { enable: true });
        }
    }
}
