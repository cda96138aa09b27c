//! Pairing context, feature negotiation and association model selection

use super::bond::Bond;
use super::constants::*;
use super::crypto::KeyPair;
use super::pdu::PairingFeatures;
use super::types::*;
use std::collections::VecDeque;
use std::time::Instant;

/// Pairing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    /// Pairing Request sent
    WaitPairingResponse,
    WaitConfirm,
    WaitRandom,
    WaitPublicKey,
    WaitDhKeyCheck,
    /// Key agreed, waiting for the link to be encrypted with it
    WaitEncryption,
    KeyDistribution,
    Paired,
}

/// Association model chosen for one pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub method: PairingMethod,
    /// Initiator types the passkey (otherwise it displays one)
    pub initiator_inputs: bool,
    /// Responder types the passkey (otherwise it displays one)
    pub responder_inputs: bool,
}

impl Association {
    const JUST_WORKS: Self = Self {
        method: PairingMethod::JustWorks,
        initiator_inputs: false,
        responder_inputs: false,
    };
    const NUMERIC_COMPARISON: Self = Self {
        method: PairingMethod::NumericComparison,
        initiator_inputs: false,
        responder_inputs: false,
    };
    const INITIATOR_INPUTS: Self = Self {
        method: PairingMethod::PasskeyEntry,
        initiator_inputs: true,
        responder_inputs: false,
    };
    const RESPONDER_INPUTS: Self = Self {
        method: PairingMethod::PasskeyEntry,
        initiator_inputs: false,
        responder_inputs: true,
    };
    const BOTH_INPUT: Self = Self {
        method: PairingMethod::PasskeyEntry,
        initiator_inputs: true,
        responder_inputs: true,
    };

    /// Whether the side in `role` types the passkey
    pub fn inputs(&self, role: PairingRole) -> bool {
        match role {
            PairingRole::Initiator => self.initiator_inputs,
            PairingRole::Responder => self.responder_inputs,
        }
    }
}

/// Map IO capabilities to an association model (Core Vol 3, Part H, 2.3.5.1)
pub fn select_method(
    initiator: IoCapability,
    responder: IoCapability,
    mitm: bool,
    secure_connections: bool,
) -> Association {
    use IoCapability::*;

    if !mitm {
        return Association::JUST_WORKS;
    }
    let sc_or = |sc: Association, legacy: Association| if secure_connections { sc } else { legacy };

    match (initiator, responder) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => Association::JUST_WORKS,

        (DisplayOnly, DisplayOnly) | (DisplayYesNo, DisplayOnly) => Association::JUST_WORKS,
        (KeyboardOnly, DisplayOnly) | (KeyboardDisplay, DisplayOnly) => Association::INITIATOR_INPUTS,

        (DisplayOnly, DisplayYesNo) => Association::JUST_WORKS,
        (DisplayYesNo, DisplayYesNo) => sc_or(Association::NUMERIC_COMPARISON, Association::JUST_WORKS),
        (KeyboardOnly, DisplayYesNo) => Association::INITIATOR_INPUTS,
        (KeyboardDisplay, DisplayYesNo) => sc_or(Association::NUMERIC_COMPARISON, Association::INITIATOR_INPUTS),

        (KeyboardOnly, KeyboardOnly) => Association::BOTH_INPUT,
        (_, KeyboardOnly) => Association::RESPONDER_INPUTS,

        (DisplayOnly, KeyboardDisplay) => Association::RESPONDER_INPUTS,
        (DisplayYesNo, KeyboardDisplay) => sc_or(Association::NUMERIC_COMPARISON, Association::RESPONDER_INPUTS),
        (KeyboardOnly, KeyboardDisplay) => Association::INITIATOR_INPUTS,
        (KeyboardDisplay, KeyboardDisplay) => sc_or(Association::NUMERIC_COMPARISON, Association::INITIATOR_INPUTS),
    }
}

/// Parameters agreed from a Pairing Request and Pairing Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub key_size: u8,
    pub secure_connections: bool,
    pub bonding: bool,
    pub association: Association,
    pub initiator_keys: KeyDistribution,
    pub responder_keys: KeyDistribution,
}

impl Negotiated {
    pub fn authenticated(&self) -> bool {
        self.association.method != PairingMethod::JustWorks
    }

    /// Keys the side in `role` distributes
    pub fn keys_from(&self, role: PairingRole) -> KeyDistribution {
        match role {
            PairingRole::Initiator => self.initiator_keys,
            PairingRole::Responder => self.responder_keys,
        }
    }
}

/// Agree on pairing parameters
///
/// `local_auth` is this side's requirement; MITM requested locally but not
/// achievable with the chosen model fails the pairing.
pub fn negotiate(
    request: &PairingFeatures,
    response: &PairingFeatures,
    local_auth: AuthRequirements,
) -> SmpResult<Negotiated> {
    let initiator_io = IoCapability::from_u8(request.io_capability)
        .ok_or_else(|| SmpError::InvalidParameter(format!("io capability 0x{:02x}", request.io_capability)))?;
    let responder_io = IoCapability::from_u8(response.io_capability)
        .ok_or_else(|| SmpError::InvalidParameter(format!("io capability 0x{:02x}", response.io_capability)))?;

    if request.max_key_size > SMP_MAX_ENCRYPTION_KEY_SIZE || response.max_key_size > SMP_MAX_ENCRYPTION_KEY_SIZE {
        return Err(SmpError::InvalidParameter("maximum key size above 16".into()));
    }
    let key_size = request.max_key_size.min(response.max_key_size);
    if key_size < SMP_MIN_ENCRYPTION_KEY_SIZE {
        return Err(SmpError::EncryptionKeySize);
    }

    let both = request.auth_req & response.auth_req;
    let secure_connections = both.contains(AuthRequirements::SECURE_CONNECTIONS);
    let bonding = both.contains(AuthRequirements::BONDING);
    let mitm = (request.auth_req | response.auth_req).contains(AuthRequirements::MITM);

    let association = select_method(initiator_io, responder_io, mitm, secure_connections);
    if local_auth.contains(AuthRequirements::MITM) && association.method == PairingMethod::JustWorks {
        return Err(SmpError::AuthenticationRequirements);
    }

    let mut unused = KeyDistribution::LINK_KEY;
    if secure_connections {
        unused |= KeyDistribution::ENC_KEY;
    }

    Ok(Negotiated {
        key_size,
        secure_connections,
        bonding,
        association,
        initiator_keys: (request.initiator_keys & response.initiator_keys) - unused,
        responder_keys: (request.responder_keys & response.responder_keys) - unused,
    })
}

/// Key distribution PDUs expected for `keys`, in transmission order
pub fn expected_key_pdus(keys: KeyDistribution) -> VecDeque<u8> {
    let mut expected = VecDeque::new();
    if keys.contains(KeyDistribution::ENC_KEY) {
        expected.push_back(SMP_ENCRYPTION_INFORMATION);
        expected.push_back(SMP_MASTER_IDENTIFICATION);
    }
    if keys.contains(KeyDistribution::ID_KEY) {
        expected.push_back(SMP_IDENTITY_INFORMATION);
        expected.push_back(SMP_IDENTITY_ADDRESS_INFORMATION);
    }
    if keys.contains(KeyDistribution::SIGN_KEY) {
        expected.push_back(SMP_SIGNING_INFORMATION);
    }
    expected
}

/// State of one pairing attempt on one link
///
/// Everything here, including the passkey round counter, is private to
/// the attempt and dropped when it ends.
#[derive(Debug)]
pub struct PairingContext {
    pub state: PairingState,
    pub started: Instant,
    /// Pairing Request PDU, opcode included
    pub preq: [u8; 7],
    /// Pairing Response PDU, opcode included
    pub pres: [u8; 7],
    pub negotiated: Option<Negotiated>,
    /// Legacy temporary key
    pub tk: [u8; 16],
    pub passkey: u32,
    pub passkey_round: u8,
    pub local_random: [u8; 16],
    pub remote_random: [u8; 16],
    pub remote_confirm: [u8; 16],
    pub keypair: Option<KeyPair>,
    pub remote_x: [u8; 32],
    pub remote_y: [u8; 32],
    pub dhkey: [u8; 32],
    pub mac_key: [u8; 16],
    /// STK (legacy) or LTK (Secure Connections) used to encrypt the link
    pub key: [u8; 16],
    pub expected_keys: VecDeque<u8>,
    pub bond: Bond,
    /// `bond` carries a key usable for later reconnections
    pub long_term: bool,
}

impl PairingContext {
    pub fn new(state: PairingState) -> Self {
        Self {
            state,
            started: Instant::now(),
            preq: [0; 7],
            pres: [0; 7],
            negotiated: None,
            tk: [0; 16],
            passkey: 0,
            passkey_round: 0,
            local_random: [0; 16],
            remote_random: [0; 16],
            remote_confirm: [0; 16],
            keypair: None,
            remote_x: [0; 32],
            remote_y: [0; 32],
            dhkey: [0; 32],
            mac_key: [0; 16],
            key: [0; 16],
            expected_keys: VecDeque::new(),
            bond: Bond::default(),
            long_term: false,
        }
    }

    pub fn negotiated(&self) -> SmpResult<Negotiated> {
        self.negotiated.ok_or(SmpError::UnexpectedPdu("pairing"))
    }

    /// `(PKax, PKbx)` as seen from `role`
    pub fn public_x(&self, role: PairingRole) -> SmpResult<([u8; 32], [u8; 32])> {
        let local = self.keypair.as_ref().ok_or(SmpError::UnexpectedPdu("public key"))?;
        Ok(match role {
            PairingRole::Initiator => (local.x, self.remote_x),
            PairingRole::Responder => (self.remote_x, local.x),
        })
    }

    /// `(Na, Nb)` as seen from `role`
    pub fn nonces(&self, role: PairingRole) -> ([u8; 16], [u8; 16]) {
        match role {
            PairingRole::Initiator => (self.local_random, self.remote_random),
            PairingRole::Responder => (self.remote_random, self.local_random),
        }
    }

    /// `z` for the current passkey confirm round
    pub fn passkey_bit(&self) -> u8 {
        0x80 | ((self.passkey >> self.passkey_round) & 0x01) as u8
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, PairingState::Idle | PairingState::Paired)
    }
}
