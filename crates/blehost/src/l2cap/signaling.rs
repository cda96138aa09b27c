//! L2CAP LE signaling channel
//!
//! This module encodes and decodes the LE signaling commands the host
//! uses, and correlates requests with their responses by identifier.

use super::constants::*;
use super::packet::L2capPacket;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP signaling command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    pub code: u8,
    pub identifier: SignalId,
    pub length: u16,
}

impl L2capCommandHeader {
    pub fn new(code: u8, identifier: SignalId, length: u16) -> Self {
        Self { code, identifier, length }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        Some(Self {
            code: cursor.read_u8().ok()?,
            identifier: cursor.read_u8().ok()?,
            length: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_SIG_HEADER_SIZE] {
        let len = self.length.to_le_bytes();
        [self.code, self.identifier, len[0], len[1]]
    }
}

/// L2CAP LE signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    },

    ConnectionParameterUpdateResponse {
        identifier: SignalId,
        result: u16,
    },

    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    LeFlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::InvalidParameter(format!("truncated {}", what)))
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST,
            Self::ConnectionParameterUpdateResponse { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::LeFlowControlCredit { .. } => L2CAP_LE_FLOW_CONTROL_CREDIT,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. } => *identifier,
        }
    }

    /// Whether this message answers a request we sent
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::CommandReject { .. }
                | Self::DisconnectionResponse { .. }
                | Self::ConnectionParameterUpdateResponse { .. }
                | Self::LeCreditBasedConnectionResponse { .. }
        )
    }

    /// Parse one signaling command
    ///
    /// Unknown codes return `NotSupported`; the caller answers those with
    /// a Command Reject using the identifier from the header.
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("signaling data too short".into()))?;
        let params = &data[L2CAP_SIG_HEADER_SIZE..];
        if params.len() < header.length as usize {
            return Err(L2capError::InvalidParameter("command parameters too short".into()));
        }
        let params = &params[..header.length as usize];
        let identifier = header.identifier;
        let mut cursor = Cursor::new(params);

        match header.code {
            L2CAP_COMMAND_REJECT => {
                let reason = read_u16(&mut cursor, "reject reason")?;
                Ok(Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                })
            }

            L2CAP_DISCONNECTION_REQUEST => Ok(Self::DisconnectionRequest {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
            }),

            L2CAP_DISCONNECTION_RESPONSE => Ok(Self::DisconnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
            }),

            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => Ok(Self::ConnectionParameterUpdateRequest {
                identifier,
                params: ConnectionParameterUpdate {
                    conn_interval_min: read_u16(&mut cursor, "interval min")?,
                    conn_interval_max: read_u16(&mut cursor, "interval max")?,
                    conn_latency: read_u16(&mut cursor, "latency")?,
                    supervision_timeout: read_u16(&mut cursor, "timeout")?,
                },
            }),

            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => Ok(Self::ConnectionParameterUpdateResponse {
                identifier,
                result: read_u16(&mut cursor, "result")?,
            }),

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => Ok(Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: read_u16(&mut cursor, "LE_PSM")?,
                source_cid: read_u16(&mut cursor, "source CID")?,
                mtu: read_u16(&mut cursor, "MTU")?,
                mps: read_u16(&mut cursor, "MPS")?,
                initial_credits: read_u16(&mut cursor, "credits")?,
            }),

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => Ok(Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: read_u16(&mut cursor, "destination CID")?,
                mtu: read_u16(&mut cursor, "MTU")?,
                mps: read_u16(&mut cursor, "MPS")?,
                initial_credits: read_u16(&mut cursor, "credits")?,
                result: read_u16(&mut cursor, "result")?,
            }),

            L2CAP_LE_FLOW_CONTROL_CREDIT => Ok(Self::LeFlowControlCredit {
                identifier,
                cid: read_u16(&mut cursor, "CID")?,
                credits: read_u16(&mut cursor, "credits")?,
            }),

            _ => Err(L2capError::NotSupported),
        }
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(10);
        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::DisconnectionRequest { destination_cid, source_cid, .. }
            | Self::DisconnectionResponse { destination_cid, source_cid, .. } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::ConnectionParameterUpdateRequest { params: p, .. } => {
                params.extend_from_slice(&p.conn_interval_min.to_le_bytes());
                params.extend_from_slice(&p.conn_interval_max.to_le_bytes());
                params.extend_from_slice(&p.conn_latency.to_le_bytes());
                params.extend_from_slice(&p.supervision_timeout.to_le_bytes());
            }

            Self::ConnectionParameterUpdateResponse { result, .. } => {
                params.extend_from_slice(&result.to_le_bytes());
            }

            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                params.extend_from_slice(&le_psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
            }

            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
            }

            Self::LeFlowControlCredit { cid, credits, .. } => {
                params.extend_from_slice(&cid.to_le_bytes());
                params.extend_from_slice(&credits.to_le_bytes());
            }
        }

        let header = L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);
        let mut result = Vec::with_capacity(L2CAP_SIG_HEADER_SIZE + params.len());
        result.extend_from_slice(&header.to_bytes());
        result.extend_from_slice(&params);
        result
    }

    /// Wrap this message in a PDU on the LE signaling channel
    pub fn to_packet(&self) -> L2capPacket {
        L2capPacket::new(L2CAP_LE_SIGNALING_CID, self.serialize())
    }
}

/// Outstanding signaling requests of one connection
#[derive(Debug)]
pub struct SignalingChannel {
    next_id: Mutex<SignalId>,
    pending: Mutex<HashMap<SignalId, Sender<SignalingMessage>>>,
}

impl Default for SignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve an identifier for a new request and a receiver for its answer
    ///
    /// Identifier 0 is never used; identifiers still awaiting a response
    /// are skipped.
    pub fn begin(&self) -> L2capResult<(SignalId, Receiver<SignalingMessage>)> {
        let mut pending = self.pending.lock().unwrap();
        let mut next = self.next_id.lock().unwrap();
        for _ in 0..u8::MAX {
            let id = *next;
            *next = if id == u8::MAX { 1 } else { id + 1 };
            if !pending.contains_key(&id) {
                let (tx, rx) = bounded(1);
                pending.insert(id, tx);
                return Ok((id, rx));
            }
        }
        Err(L2capError::ResourceLimitReached)
    }

    /// Identifier for a command that expects no response
    pub fn next_identifier(&self) -> SignalId {
        let pending = self.pending.lock().unwrap();
        let mut next = self.next_id.lock().unwrap();
        loop {
            let id = *next;
            *next = if id == u8::MAX { 1 } else { id + 1 };
            if !pending.contains_key(&id) || pending.len() >= u8::MAX as usize {
                return id;
            }
        }
    }

    /// Forget a request that timed out or failed to send
    pub fn cancel(&self, id: SignalId) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Hand a response to its waiter; returns false if nobody asked
    pub fn complete(&self, message: SignalingMessage) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&message.identifier());
        match waiter {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter so blocked requests observe the connection ending
    pub fn close(&self) {
        self.pending.lock().unwrap().clear();
    }
}
