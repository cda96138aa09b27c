//! Byte transports to the controller
//!
//! The session only needs a duplex byte stream carrying H4 framing: a raw
//! HCI socket, a UART or a TCP bridge all fit behind [`Transport`].
//! [`PacketReader`] turns the stream back into whole HCI packets.

pub mod socket;
pub mod tcp;
pub mod uart;

#[cfg(test)]
mod tests;

pub use socket::HciSocket;
pub use tcp::TcpTransport;
pub use uart::UartTransport;

use crate::error::HciError;
use crate::hci::constants::*;
use std::io;

/// A duplex byte channel to the controller
///
/// `read` returning `Ok(0)` means end of stream. `TimedOut`, `WouldBlock`
/// and `Interrupted` errors mean no data was available yet; the read loop
/// retries after checking for shutdown.
pub trait Transport: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn close(&self);
}

/// Write a whole packet, looping over short writes
pub fn write_all(transport: &dyn Transport, mut buf: &[u8]) -> Result<(), HciError> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(HciError::Eof),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HciError::SendError(e)),
        }
    }
    Ok(())
}

/// Whether a read error only means "nothing yet"
pub(crate) fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Reassembles H4 packets from arbitrary read boundaries
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(1024) }
    }

    /// Feed bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Total length of the packet at the head of the buffer, if known
    fn packet_len(&self) -> Result<Option<usize>, HciError> {
        let Some(&packet_type) = self.buf.first() else {
            return Ok(None);
        };
        let (hdr, len_of): (usize, fn(&[u8]) -> usize) = match packet_type {
            HCI_EVENT_PKT => (HCI_EVENT_HDR_SIZE, |h| h[1] as usize),
            HCI_ACL_PKT => (HCI_ACL_HDR_SIZE, |h| u16::from_le_bytes([h[2], h[3]]) as usize),
            HCI_COMMAND_PKT => (HCI_COMMAND_HDR_SIZE, |h| h[2] as usize),
            HCI_SCO_PKT => (HCI_SCO_HDR_SIZE, |h| h[2] as usize),
            HCI_ISO_PKT => (HCI_ISO_HDR_SIZE, |h| {
                (u16::from_le_bytes([h[2], h[3]]) & 0x3FFF) as usize
            }),
            other => return Err(HciError::UnknownPacketType(other)),
        };
        if self.buf.len() < 1 + hdr {
            return Ok(None);
        }
        Ok(Some(1 + hdr + len_of(&self.buf[1..1 + hdr])))
    }

    /// Pop the next complete packet, type byte included
    ///
    /// An unknown packet type drops the offending byte and reports the
    /// error so the caller can log it; the next call resynchronises.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, HciError> {
        match self.packet_len() {
            Ok(Some(len)) if self.buf.len() >= len => {
                let rest = self.buf.split_off(len);
                Ok(Some(std::mem::replace(&mut self.buf, rest)))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                self.buf.remove(0);
                Err(e)
            }
        }
    }
}
