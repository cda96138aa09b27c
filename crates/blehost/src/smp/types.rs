//! Type definitions for the Security Manager Protocol

use super::constants::*;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// SMP Error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("smp: invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("smp: peer reported pairing failure (reason 0x{0:02x})")]
    PairingFailed(u8),

    #[error("smp: passkey entry failed")]
    PasskeyEntryFailed,

    #[error("smp: authentication requirements not met")]
    AuthenticationRequirements,

    #[error("smp: confirm value mismatch")]
    ConfirmValueFailed,

    #[error("smp: command 0x{0:02x} not supported")]
    CommandNotSupported(u8),

    #[error("smp: pairing not supported")]
    PairingNotSupported,

    #[error("smp: encryption key size too small")]
    EncryptionKeySize,

    #[error("smp: unexpected {0} PDU")]
    UnexpectedPdu(&'static str),

    #[error("smp: DHKey check failed")]
    DhKeyCheckFailed,

    #[error("smp: numeric comparison rejected")]
    NumericComparisonFailed,

    #[error("smp: pairing timed out")]
    Timeout,

    #[error("smp: pairing already in progress")]
    InProgress,

    #[error("smp: encryption failed (status 0x{0:02x})")]
    EncryptionFailed(u8),

    #[error("smp: no bond for peer")]
    NotPaired,

    #[error("smp: cryptographic error: {0}")]
    Crypto(String),

    #[error("smp: transport error: {0}")]
    Transport(String),

    #[error("smp: link closed")]
    Closed,
}

impl SmpError {
    /// Reason code sent in a Pairing Failed PDU for a local failure
    pub fn reason_code(&self) -> u8 {
        match self {
            Self::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            Self::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            Self::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            Self::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            Self::CommandNotSupported(_) => SMP_REASON_COMMAND_NOT_SUPPORTED,
            Self::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            Self::InvalidParameter(_) => SMP_REASON_INVALID_PARAMETERS,
            Self::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            Self::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            Self::PairingFailed(reason) => *reason,
            _ => SMP_REASON_UNSPECIFIED_REASON,
        }
    }
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

bitflags! {
    /// AuthReq field of Pairing Request/Response and Security Request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthRequirements: u8 {
        const BONDING = 0x01;
        const MITM = 0x04;
        const SECURE_CONNECTIONS = 0x08;
        const KEYPRESS = 0x10;
        const CT2 = 0x20;
    }
}

bitflags! {
    /// Key distribution field of Pairing Request/Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDistribution: u8 {
        /// LTK, EDIV and Rand (legacy pairing only)
        const ENC_KEY = 0x01;
        /// IRK and identity address
        const ID_KEY = 0x02;
        /// CSRK
        const SIGN_KEY = 0x04;
        const LINK_KEY = 0x08;
    }
}

/// Pairing methods offered by this stack; OOB is never selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    /// Just Works method - no user interaction
    JustWorks,
    /// Passkey Entry - one device enters a passkey
    PasskeyEntry,
    /// Numeric Comparison - user confirms matching numbers
    NumericComparison,
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::JustWorks => write!(f, "Just Works"),
            PairingMethod::PasskeyEntry => write!(f, "Passkey Entry"),
            PairingMethod::NumericComparison => write!(f, "Numeric Comparison"),
        }
    }
}

/// Pairing Role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingRole {
    /// Initiator of the pairing (the central)
    Initiator,
    /// Responder to pairing (the peripheral)
    Responder,
}

/// Security level for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    #[default]
    None = 0,
    /// Encryption without authentication (Just Works)
    EncryptionOnly = 1,
    /// Encryption with authentication (MITM protection)
    EncryptionWithAuthentication = 2,
    /// Authenticated LE Secure Connections
    SecureConnections = 3,
}

impl SecurityLevel {
    pub fn is_encrypted(&self) -> bool {
        *self >= SecurityLevel::EncryptionOnly
    }

    pub fn is_authenticated(&self) -> bool {
        *self >= SecurityLevel::EncryptionWithAuthentication
    }
}

/// Local pairing preferences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    pub io_capability: IoCapability,
    pub auth_req: AuthRequirements,
    /// Maximum encryption key size (7-16)
    pub max_key_size: u8,
    /// Keys we ask the initiator to distribute
    pub initiator_keys: KeyDistribution,
    /// Keys we ask the responder to distribute
    pub responder_keys: KeyDistribution,
    /// Fixed passkey to display or enter, if any
    pub passkey: Option<u32>,
    /// This device's Identity Resolving Key; ID_KEY is only offered with one
    pub identity_key: Option<[u8; 16]>,
    /// This device's Connection Signature Resolving Key; SIGN_KEY is only
    /// offered with one
    pub signing_key: Option<[u8; 16]>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            auth_req: AuthRequirements::BONDING | AuthRequirements::SECURE_CONNECTIONS,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            initiator_keys: KeyDistribution::empty(),
            responder_keys: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            passkey: None,
            identity_key: None,
            signing_key: None,
        }
    }
}

impl PairingConfig {
    /// Keys this device is able to hand out
    pub fn distributable_keys(&self) -> KeyDistribution {
        let mut keys = KeyDistribution::ENC_KEY;
        if self.identity_key.is_some() {
            keys |= KeyDistribution::ID_KEY;
        }
        if self.signing_key.is_some() {
            keys |= KeyDistribution::SIGN_KEY;
        }
        keys
    }
}

/// Callback showing a passkey or comparison value to the user
pub type DisplayFn = Arc<dyn Fn(u32) + Send + Sync>;
/// Callback asking the user to confirm a numeric comparison value
pub type ConfirmFn = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// User interaction data for one pairing attempt
#[derive(Clone, Default)]
pub struct AuthData {
    /// Passkey to enter, or to display instead of a random one
    pub passkey: Option<u32>,
    /// Called with the passkey this side displays
    pub display: Option<DisplayFn>,
    /// Called with the six digit value during numeric comparison;
    /// without it the comparison is accepted
    pub confirm: Option<ConfirmFn>,
}

impl AuthData {
    pub fn with_passkey(passkey: u32) -> Self {
        Self {
            passkey: Some(passkey),
            ..Self::default()
        }
    }
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthData")
            .field("passkey", &self.passkey.map(|_| "******"))
            .field("display", &self.display.is_some())
            .field("confirm", &self.confirm.is_some())
            .finish()
    }
}
