//! L2CAP recombination and fragmentation over ACL
//!
//! Inbound fragments are concatenated until the basic L2CAP header's
//! length is satisfied. A start fragment in the middle of a PDU, a
//! continuation with nothing in progress, or more bytes than the header
//! declared are framing errors; the caller tears the link down.

use crate::hci::{AclHeader, AclPacket, BoundaryFlag};
use crate::l2cap::constants::L2CAP_BASIC_HEADER_SIZE;
use crate::l2cap::{L2capError, L2capHeader, L2capPacket, L2capResult};

/// Per-connection reassembly cursor
#[derive(Debug)]
pub struct Reassembler {
    handle: u16,
    buf: Vec<u8>,
    in_progress: bool,
}

impl Reassembler {
    pub fn new(handle: u16) -> Self {
        Self {
            handle,
            buf: Vec::new(),
            in_progress: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.in_progress
    }

    fn framing(&mut self, reason: String) -> L2capError {
        self.buf.clear();
        self.in_progress = false;
        L2capError::Framing {
            handle: self.handle,
            reason,
        }
    }

    /// Consume one fragment, returning a PDU once it is complete
    pub fn push(&mut self, packet: &AclPacket) -> L2capResult<Option<L2capPacket>> {
        if packet.header.boundary.is_start() {
            if self.in_progress {
                let have = self.buf.len();
                return Err(self.framing(format!("start fragment after {} bytes of an unfinished PDU", have)));
            }
            self.in_progress = true;
            self.buf.clear();
        } else if !self.in_progress {
            return Err(self.framing("continuing fragment without a start".into()));
        }
        self.buf.extend_from_slice(&packet.data);

        // The header itself may be split across fragments
        let Some(header) = L2capHeader::parse(&self.buf) else {
            return Ok(None);
        };
        let expected = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if self.buf.len() < expected {
            return Ok(None);
        }
        if self.buf.len() > expected {
            let (have, declared) = (self.buf.len(), expected);
            return Err(self.framing(format!("{} bytes received for a {} byte PDU", have, declared)));
        }

        self.in_progress = false;
        let pdu = std::mem::take(&mut self.buf);
        L2capPacket::parse(&pdu).map(Some)
    }
}

/// Split a serialized L2CAP PDU into ACL fragments of at most `acl_mtu` bytes
pub fn fragment(handle: u16, pdu: &[u8], acl_mtu: usize) -> Vec<AclPacket> {
    let mtu = acl_mtu.max(1);
    pdu.chunks(mtu)
        .enumerate()
        .map(|(i, chunk)| {
            let boundary = if i == 0 {
                BoundaryFlag::FirstNonFlushable
            } else {
                BoundaryFlag::Continuing
            };
            AclPacket {
                header: AclHeader::new(handle, boundary, chunk.len() as u16),
                data: chunk.to_vec(),
            }
        })
        .collect()
}
