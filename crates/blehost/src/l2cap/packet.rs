//! L2CAP Packet handling
//!
//! Basic frames on fixed channels and K-frames on credit based channels.

use super::constants::*;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        result[0..2].copy_from_slice(&self.length.to_le_bytes());
        result[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        result
    }
}

/// A complete L2CAP basic frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    pub channel_id: u16,
    pub payload: Vec<u8>,
}

impl L2capPacket {
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self { channel_id, payload }
    }

    /// Parse a complete PDU; the header length must match the payload
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("PDU shorter than header".into()))?;
        let payload = &data[L2CAP_BASIC_HEADER_SIZE..];
        if payload.len() != header.length as usize {
            return Err(L2capError::InvalidParameter(format!(
                "PDU declares {} bytes, carries {}",
                header.length,
                payload.len()
            )));
        }
        Ok(Self {
            channel_id: header.channel_id,
            payload: payload.to_vec(),
        })
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = L2capHeader::new(self.payload.len() as u16, self.channel_id);
        let mut bytes = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Split an SDU into K-frame payloads no larger than `remote_mps - 2`
///
/// The first frame is prefixed with the total SDU length.
pub fn segment_sdu(sdu: &[u8], remote_mps: u16) -> L2capResult<Vec<Vec<u8>>> {
    let chunk = (remote_mps as usize).saturating_sub(L2CAP_SDU_LENGTH_SIZE);
    if chunk == 0 {
        return Err(L2capError::InvalidParameter(format!("MPS {} too small", remote_mps)));
    }

    let mut frames = Vec::with_capacity(sdu.len() / chunk + 1);
    let mut chunks = sdu.chunks(chunk);

    let mut first = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + chunk.min(sdu.len()));
    first.extend_from_slice(&(sdu.len() as u16).to_le_bytes());
    if let Some(data) = chunks.next() {
        first.extend_from_slice(data);
    }
    frames.push(first);
    frames.extend(chunks.map(|c| c.to_vec()));
    Ok(frames)
}
