//! Test doubles: an in-memory transport and a scripted controller

use crate::conn::recombine::{fragment, Reassembler};
use crate::hci::constants::*;
use crate::hci::{AclHeader, AclPacket, BoundaryFlag, HciCommand, HciEvent};
use crate::l2cap::L2capPacket;
use crate::transport::{PacketReader, Transport};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const LOCAL_BD_ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
pub const PEER_BD_ADDR: [u8; 6] = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6];
pub const ACL_MTU: u16 = 27;
pub const ACL_BUFFERS: u8 = 4;

const POLL: Duration = Duration::from_millis(20);
pub const WAIT: Duration = Duration::from_secs(2);

/// Host end of an in-memory byte pipe
pub struct MemoryTransport {
    from_controller: Receiver<Vec<u8>>,
    to_controller: Sender<Vec<u8>>,
    pending: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            match self.from_controller.recv_timeout(POLL) {
                Ok(bytes) => pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(pending.len());
        for (slot, byte) in buf.iter_mut().zip(pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.to_controller
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Script {
    /// Commands seen, with a flag once a test consumed them
    commands: Vec<(u16, Vec<u8>, bool)>,
    /// Opcodes answered by the test instead of automatically
    held: HashSet<u16>,
    /// Opcodes never answered
    silent: HashSet<u16>,
    /// Return parameters (status first) for Command Complete
    returns: HashMap<u16, Vec<u8>>,
    acl: VecDeque<AclPacket>,
}

/// A controller that answers commands on its own
///
/// Commands answered with Command Status: Disconnect (followed by a
/// Disconnection Complete), LE Create Connection, LE Connection Update and
/// LE Start Encryption. Everything else gets a successful Command Complete
/// unless held or silenced. Each ACL packet written by the host is
/// acknowledged with Number Of Completed Packets.
pub struct FakeController {
    to_host: Sender<Vec<u8>>,
    script: Mutex<Script>,
    changed: Condvar,
    auto_complete: AtomicBool,
    stopped: AtomicBool,
}

impl FakeController {
    /// Create a controller and the transport the host should use
    pub fn new() -> (Arc<Self>, Arc<MemoryTransport>) {
        let (to_host, from_controller) = unbounded();
        let (to_controller, from_host) = unbounded();
        let transport = Arc::new(MemoryTransport {
            from_controller,
            to_controller,
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        let mut script = Script::default();
        let mut bd_addr = vec![HCI_SUCCESS];
        bd_addr.extend_from_slice(&LOCAL_BD_ADDR);
        script.returns.insert(HciCommand::ReadBdAddr.opcode(), bd_addr);
        let mtu = ACL_MTU.to_le_bytes();
        script
            .returns
            .insert(HciCommand::LeReadBufferSize.opcode(), vec![HCI_SUCCESS, mtu[0], mtu[1], ACL_BUFFERS]);

        let controller = Arc::new(Self {
            to_host,
            script: Mutex::new(script),
            changed: Condvar::new(),
            auto_complete: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        let runner = controller.clone();
        thread::spawn(move || runner.run(from_host));
        (controller, transport)
    }

    fn run(&self, from_host: Receiver<Vec<u8>>) {
        let mut reader = PacketReader::new();
        while !self.stopped.load(Ordering::SeqCst) {
            match from_host.recv_timeout(POLL) {
                Ok(bytes) => reader.push(&bytes),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(Some(packet)) = reader.next_packet() {
                match packet[0] {
                    HCI_COMMAND_PKT => self.on_command(&packet[1..]),
                    HCI_ACL_PKT => self.on_acl(&packet[1..]),
                    _ => {}
                }
            }
        }
    }

    fn on_command(&self, body: &[u8]) {
        let opcode = u16::from_le_bytes([body[0], body[1]]);
        let params = body[3..].to_vec();
        let (held, silent, ret) = {
            let mut script = self.script.lock().unwrap();
            script.commands.push((opcode, params.clone(), false));
            self.changed.notify_all();
            (
                script.held.contains(&opcode),
                script.silent.contains(&opcode),
                script.returns.get(&opcode).cloned(),
            )
        };
        if held || silent {
            return;
        }

        let status_answered = [
            OP_DISCONNECT,
            OP_LE_CREATE_CONNECTION,
            OP_LE_START_ENCRYPTION,
            crate::hci::constants::opcode(OGF_LE, OCF_LE_CONNECTION_UPDATE),
        ];
        if status_answered.contains(&opcode) {
            self.command_status(opcode, HCI_SUCCESS);
            if opcode == OP_DISCONNECT {
                let handle = u16::from_le_bytes([params[0], params[1]]);
                self.disconnection_complete(handle, HCI_LOCAL_HOST_TERMINATED);
            }
        } else {
            self.command_complete(opcode, &ret.unwrap_or_else(|| vec![HCI_SUCCESS]));
        }
    }

    fn on_acl(&self, body: &[u8]) {
        let Some(packet) = AclPacket::parse(body) else {
            return;
        };
        let handle = packet.header.handle;
        {
            let mut script = self.script.lock().unwrap();
            script.acl.push_back(packet);
            self.changed.notify_all();
        }
        if self.auto_complete.load(Ordering::SeqCst) {
            self.completed_packets(handle, 1);
        }
    }

    /// Stop reading from the host; the host sees end of stream once the
    /// controller is dropped
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Keep ACL buffers until the test releases them
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    pub fn hold(&self, opcode: u16) {
        self.script.lock().unwrap().held.insert(opcode);
    }

    pub fn silence(&self, opcode: u16) {
        self.script.lock().unwrap().silent.insert(opcode);
    }

    pub fn set_return(&self, opcode: u16, params: Vec<u8>) {
        self.script.lock().unwrap().returns.insert(opcode, params);
    }

    /// Number of commands with `opcode` seen so far
    pub fn count(&self, opcode: u16) -> usize {
        self.script
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(op, _, _)| *op == opcode)
            .count()
    }

    /// Opcodes in the order they arrived
    pub fn opcodes(&self) -> Vec<u16> {
        self.script.lock().unwrap().commands.iter().map(|(op, _, _)| *op).collect()
    }

    /// Wait for the next unconsumed command with `opcode` and return its parameters
    pub fn expect_command(&self, opcode: u16, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut script = self.script.lock().unwrap();
        loop {
            if let Some(entry) = script.commands.iter_mut().find(|(op, _, used)| *op == opcode && !used) {
                entry.2 = true;
                return Some(entry.1.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            script = self.changed.wait_timeout(script, deadline - now).unwrap().0;
        }
    }

    pub fn expect_acl(&self, timeout: Duration) -> Option<AclPacket> {
        let deadline = Instant::now() + timeout;
        let mut script = self.script.lock().unwrap();
        loop {
            if let Some(packet) = script.acl.pop_front() {
                return Some(packet);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            script = self.changed.wait_timeout(script, deadline - now).unwrap().0;
        }
    }

    /// Reassemble the next L2CAP PDU the host sent
    pub fn expect_pdu(&self, timeout: Duration) -> Option<L2capPacket> {
        let deadline = Instant::now() + timeout;
        let mut reassembler = Reassembler::new(0);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let packet = self.expect_acl(left)?;
            if let Ok(Some(pdu)) = reassembler.push(&packet) {
                return Some(pdu);
            }
        }
    }

    /// Next PDU on `cid`, skipping others
    pub fn expect_pdu_on(&self, cid: u16, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let pdu = self.expect_pdu(left)?;
            if pdu.channel_id == cid {
                return Some(pdu.payload);
            }
        }
    }

    // Controller to host

    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.to_host.send(bytes);
    }

    pub fn event(&self, code: u8, params: Vec<u8>) {
        self.send_raw(HciEvent::new(code, params).to_packet());
    }

    pub fn le_event(&self, subevent: u8, params: &[u8]) {
        let mut body = vec![subevent];
        body.extend_from_slice(params);
        self.event(EVT_LE_META_EVENT, body);
    }

    /// Answer a held command
    pub fn command_complete(&self, opcode: u16, return_parameters: &[u8]) {
        let mut params = vec![1];
        params.extend_from_slice(&opcode.to_le_bytes());
        params.extend_from_slice(return_parameters);
        self.event(EVT_CMD_COMPLETE, params);
    }

    pub fn command_status(&self, opcode: u16, status: u8) {
        let mut params = vec![status, 1];
        params.extend_from_slice(&opcode.to_le_bytes());
        self.event(EVT_CMD_STATUS, params);
    }

    pub fn connection_complete(&self, handle: u16, role: u8, peer: [u8; 6]) {
        let mut params = vec![HCI_SUCCESS];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(role);
        params.push(0x00);
        params.extend_from_slice(&peer);
        params.extend_from_slice(&0x0028u16.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        params.extend_from_slice(&0x01F4u16.to_le_bytes());
        params.push(0x00);
        self.le_event(EVT_LE_CONN_COMPLETE, &params);
    }

    pub fn disconnection_complete(&self, handle: u16, reason: u8) {
        let mut params = vec![HCI_SUCCESS];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(reason);
        self.event(EVT_DISCONN_COMPLETE, params);
    }

    pub fn encryption_change(&self, handle: u16, status: u8, enabled: bool) {
        let mut params = vec![status];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(enabled as u8);
        self.event(EVT_ENCRYPTION_CHANGE, params);
    }

    pub fn completed_packets(&self, handle: u16, count: u16) {
        let mut params = vec![1];
        params.extend_from_slice(&handle.to_le_bytes());
        params.extend_from_slice(&count.to_le_bytes());
        self.event(EVT_NUM_COMP_PKTS, params);
    }

    pub fn acl(&self, handle: u16, boundary: BoundaryFlag, data: &[u8]) {
        let packet = AclPacket {
            header: AclHeader::new(handle, boundary, data.len() as u16),
            data: data.to_vec(),
        };
        self.send_raw(packet.to_packet());
    }

    /// Send one L2CAP PDU, fragmented at `mtu`
    pub fn pdu(&self, handle: u16, cid: u16, payload: &[u8], mtu: usize) {
        let bytes = L2capPacket::new(cid, payload.to_vec()).to_bytes();
        for packet in fragment(handle, &bytes, mtu) {
            self.send_raw(packet.to_packet());
        }
    }
}

impl Drop for FakeController {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
