//! SMP PDU encoding and decoding

use super::constants::*;
use super::types::*;
use crate::address::{Address, AddressType};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Body of a Pairing Request or Pairing Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: u8,
    pub oob_data_present: bool,
    pub auth_req: AuthRequirements,
    pub max_key_size: u8,
    pub initiator_keys: KeyDistribution,
    pub responder_keys: KeyDistribution,
}

impl PairingFeatures {
    /// Local features for `role`, offering only keys this side holds
    pub fn from_config(config: &PairingConfig, role: PairingRole) -> Self {
        let mut features = Self {
            io_capability: config.io_capability.to_u8(),
            oob_data_present: false,
            auth_req: config.auth_req,
            max_key_size: config.max_key_size,
            initiator_keys: config.initiator_keys,
            responder_keys: config.responder_keys,
        };
        match role {
            PairingRole::Initiator => features.initiator_keys &= config.distributable_keys(),
            PairingRole::Responder => features.responder_keys &= config.distributable_keys(),
        }
        features
    }

    fn parse(cursor: &mut Cursor<&[u8]>) -> Option<Self> {
        Some(Self {
            io_capability: cursor.read_u8().ok()?,
            oob_data_present: cursor.read_u8().ok()? != 0,
            auth_req: AuthRequirements::from_bits_truncate(cursor.read_u8().ok()?),
            max_key_size: cursor.read_u8().ok()?,
            initiator_keys: KeyDistribution::from_bits_truncate(cursor.read_u8().ok()?),
            responder_keys: KeyDistribution::from_bits_truncate(cursor.read_u8().ok()?),
        })
    }

    /// The full 7-byte PDU as used by c1 (`preq`/`pres`)
    pub fn to_pdu(&self, opcode: u8) -> [u8; 7] {
        [
            opcode,
            self.io_capability,
            self.oob_data_present as u8,
            self.auth_req.bits(),
            self.max_key_size,
            self.initiator_keys.bits(),
            self.responder_keys.bits(),
        ]
    }
}

/// One SMP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm([u8; 16]),
    PairingRandom([u8; 16]),
    PairingFailed(u8),
    EncryptionInformation([u8; 16]),
    MasterIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation([u8; 16]),
    IdentityAddressInformation(Address),
    SigningInformation([u8; 16]),
    SecurityRequest(AuthRequirements),
    /// X and Y coordinates, little-endian
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck([u8; 16]),
    KeypressNotification(u8),
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    cursor.read_exact(&mut out).ok()?;
    Some(out)
}

impl SmpPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::PairingRequest(_) => SMP_PAIRING_REQUEST,
            Self::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            Self::PairingConfirm(_) => SMP_PAIRING_CONFIRM,
            Self::PairingRandom(_) => SMP_PAIRING_RANDOM,
            Self::PairingFailed(_) => SMP_PAIRING_FAILED,
            Self::EncryptionInformation(_) => SMP_ENCRYPTION_INFORMATION,
            Self::MasterIdentification { .. } => SMP_MASTER_IDENTIFICATION,
            Self::IdentityInformation(_) => SMP_IDENTITY_INFORMATION,
            Self::IdentityAddressInformation(_) => SMP_IDENTITY_ADDRESS_INFORMATION,
            Self::SigningInformation(_) => SMP_SIGNING_INFORMATION,
            Self::SecurityRequest(_) => SMP_SECURITY_REQUEST,
            Self::PairingPublicKey { .. } => SMP_PAIRING_PUBLIC_KEY,
            Self::PairingDhKeyCheck(_) => SMP_PAIRING_DHK_CHECK,
            Self::KeypressNotification(_) => SMP_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    /// Parse a PDU; the length must match the opcode's fixed size
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        let (&opcode, body) = data
            .split_first()
            .ok_or_else(|| SmpError::InvalidParameter("empty PDU".into()))?;
        let mut cursor = Cursor::new(body);

        let expected = match opcode {
            SMP_PAIRING_REQUEST | SMP_PAIRING_RESPONSE => 6,
            SMP_PAIRING_CONFIRM
            | SMP_PAIRING_RANDOM
            | SMP_ENCRYPTION_INFORMATION
            | SMP_IDENTITY_INFORMATION
            | SMP_SIGNING_INFORMATION
            | SMP_PAIRING_DHK_CHECK => 16,
            SMP_PAIRING_FAILED | SMP_SECURITY_REQUEST | SMP_PAIRING_KEYPRESS_NOTIFICATION => 1,
            SMP_MASTER_IDENTIFICATION => 10,
            SMP_IDENTITY_ADDRESS_INFORMATION => 7,
            SMP_PAIRING_PUBLIC_KEY => 64,
            _ => return Err(SmpError::CommandNotSupported(opcode)),
        };
        if body.len() != expected {
            return Err(SmpError::InvalidParameter(format!(
                "opcode 0x{:02x}: {} bytes, expected {}",
                opcode,
                body.len(),
                expected
            )));
        }

        let truncated = || SmpError::InvalidParameter("truncated PDU".into());
        let pdu = match opcode {
            SMP_PAIRING_REQUEST => Self::PairingRequest(PairingFeatures::parse(&mut cursor).ok_or_else(truncated)?),
            SMP_PAIRING_RESPONSE => Self::PairingResponse(PairingFeatures::parse(&mut cursor).ok_or_else(truncated)?),
            SMP_PAIRING_CONFIRM => Self::PairingConfirm(read_array(&mut cursor).ok_or_else(truncated)?),
            SMP_PAIRING_RANDOM => Self::PairingRandom(read_array(&mut cursor).ok_or_else(truncated)?),
            SMP_PAIRING_FAILED => Self::PairingFailed(body[0]),
            SMP_ENCRYPTION_INFORMATION => {
                Self::EncryptionInformation(read_array(&mut cursor).ok_or_else(truncated)?)
            }
            SMP_MASTER_IDENTIFICATION => Self::MasterIdentification {
                ediv: cursor.read_u16::<LittleEndian>().map_err(|_| truncated())?,
                rand: read_array(&mut cursor).ok_or_else(truncated)?,
            },
            SMP_IDENTITY_INFORMATION => Self::IdentityInformation(read_array(&mut cursor).ok_or_else(truncated)?),
            SMP_IDENTITY_ADDRESS_INFORMATION => {
                let kind = AddressType::from_u8(body[0]);
                let mut bytes = [0u8; 6];
                bytes.copy_from_slice(&body[1..7]);
                Self::IdentityAddressInformation(Address::new(bytes, kind))
            }
            SMP_SIGNING_INFORMATION => Self::SigningInformation(read_array(&mut cursor).ok_or_else(truncated)?),
            SMP_SECURITY_REQUEST => Self::SecurityRequest(AuthRequirements::from_bits_truncate(body[0])),
            SMP_PAIRING_PUBLIC_KEY => Self::PairingPublicKey {
                x: read_array(&mut cursor).ok_or_else(truncated)?,
                y: read_array(&mut cursor).ok_or_else(truncated)?,
            },
            SMP_PAIRING_DHK_CHECK => Self::PairingDhKeyCheck(read_array(&mut cursor).ok_or_else(truncated)?),
            _ => Self::KeypressNotification(body[0]),
        };
        Ok(pdu)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        match self {
            Self::PairingRequest(f) | Self::PairingResponse(f) => {
                out.extend_from_slice(&f.to_pdu(self.opcode()));
                return out;
            }
            _ => out.push(self.opcode()),
        }
        match self {
            Self::PairingConfirm(v)
            | Self::PairingRandom(v)
            | Self::EncryptionInformation(v)
            | Self::IdentityInformation(v)
            | Self::SigningInformation(v)
            | Self::PairingDhKeyCheck(v) => out.extend_from_slice(v),
            Self::PairingFailed(reason) => out.push(*reason),
            Self::MasterIdentification { ediv, rand } => {
                out.extend_from_slice(&ediv.to_le_bytes());
                out.extend_from_slice(rand);
            }
            Self::IdentityAddressInformation(addr) => {
                out.push(addr.kind.to_u8());
                out.extend_from_slice(&addr.bytes);
            }
            Self::SecurityRequest(auth) => out.push(auth.bits()),
            Self::PairingPublicKey { x, y } => {
                out.extend_from_slice(x);
                out.extend_from_slice(y);
            }
            Self::KeypressNotification(kind) => out.push(*kind),
            Self::PairingRequest(_) | Self::PairingResponse(_) => {}
        }
        out
    }
}
