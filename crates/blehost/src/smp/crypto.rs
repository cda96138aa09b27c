//! Cryptographic functions for the Security Manager Protocol
//!
//! Every value here is in SMP wire order (least significant octet first).
//! AES and AES-CMAC work most significant octet first, so keys, inputs and
//! outputs are reversed around the block cipher.

use super::types::*;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

// Key derivation salt for f5, SALT = 0x6C888391AAF5A53860370BDB5A6083BE
const F5_SALT: [u8; 16] = [
    0xbe, 0x83, 0x60, 0x5a, 0xdb, 0x0b, 0x37, 0x60, 0x38, 0xa5, 0xf5, 0xaa, 0x91, 0x83, 0x88, 0x6c,
];
// keyID "btle"
const F5_KEY_ID: [u8; 4] = [0x65, 0x6c, 0x74, 0x62];
const F5_LENGTH: [u8; 2] = [0x00, 0x01];

fn reversed<const N: usize>(input: &[u8; N]) -> [u8; N] {
    let mut out = *input;
    out.reverse();
    out
}

/// Generate a 128-bit random number
pub fn generate_random_128() -> [u8; 16] {
    let mut out = [0u8; 16];
    OsRng.fill_bytes(&mut out);
    out
}

/// Generate a random passkey (0-999999)
pub fn generate_passkey() -> u32 {
    OsRng.gen_range(0..1_000_000)
}

/// Security function e: AES-128 of one block
pub fn e(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(&reversed(key)));
    let mut block = GenericArray::clone_from_slice(&reversed(plaintext));
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out.reverse();
    out
}

/// AES-CMAC (RFC 4493) over little-endian key and message
pub fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&reversed(key)));
    let mut msb_first = message.to_vec();
    msb_first.reverse();
    mac.update(&msb_first);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out.reverse();
    out
}

fn xor_128(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Function c1 for LE Legacy Pairing (Core Vol 3, Part H, 2.2.3)
///
/// `preq` and `pres` are the full 7-byte Pairing Request and Response PDUs.
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    iat: u8,
    ia: &[u8; 6],
    rat: u8,
    ra: &[u8; 6],
) -> [u8; 16] {
    // p1 = pres || preq || rat || iat
    let mut p1 = [0u8; 16];
    p1[0] = iat;
    p1[1] = rat;
    p1[2..9].copy_from_slice(preq);
    p1[9..16].copy_from_slice(pres);

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[0..6].copy_from_slice(ra);
    p2[6..12].copy_from_slice(ia);

    let res = e(k, &xor_128(r, &p1));
    e(k, &xor_128(&res, &p2))
}

/// Function s1 for LE Legacy Pairing (Core Vol 3, Part H, 2.2.4)
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut r = [0u8; 16];
    r[0..8].copy_from_slice(&r2[0..8]);
    r[8..16].copy_from_slice(&r1[0..8]);
    e(k, &r)
}

/// Confirm value generation function f4 (Core Vol 3, Part H, 2.2.6)
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    let mut m = [0u8; 65];
    m[0] = z;
    m[1..33].copy_from_slice(v);
    m[33..65].copy_from_slice(u);
    aes_cmac(x, &m)
}

/// Key generation function f5 (Core Vol 3, Part H, 2.2.7)
///
/// Returns `(MacKey, LTK)`. `a1` and `a2` are address-plus-type.
pub fn f5(
    w: &[u8; 32],
    n1: &[u8; 16],
    n2: &[u8; 16],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> ([u8; 16], [u8; 16]) {
    let mut w_block = [0u8; 32];
    w_block.copy_from_slice(w);
    let t = aes_cmac(&F5_SALT, &w_block);

    let mut m = [0u8; 53];
    m[0..2].copy_from_slice(&F5_LENGTH);
    m[2..9].copy_from_slice(a2);
    m[9..16].copy_from_slice(a1);
    m[16..32].copy_from_slice(n2);
    m[32..48].copy_from_slice(n1);
    m[48..52].copy_from_slice(&F5_KEY_ID);

    m[52] = 0;
    let mac_key = aes_cmac(&t, &m);
    m[52] = 1;
    let ltk = aes_cmac(&t, &m);
    (mac_key, ltk)
}

/// Check value generation function f6 (Core Vol 3, Part H, 2.2.8)
pub fn f6(
    w: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> [u8; 16] {
    let mut m = [0u8; 65];
    m[0..7].copy_from_slice(a2);
    m[7..14].copy_from_slice(a1);
    m[14..17].copy_from_slice(io_cap);
    m[17..33].copy_from_slice(r);
    m[33..49].copy_from_slice(n2);
    m[49..65].copy_from_slice(n1);
    aes_cmac(w, &m)
}

/// Numeric comparison value function g2 (Core Vol 3, Part H, 2.2.9)
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mut m = [0u8; 80];
    m[0..16].copy_from_slice(y);
    m[16..48].copy_from_slice(v);
    m[48..80].copy_from_slice(u);
    let out = aes_cmac(x, &m);
    u32::from_le_bytes([out[0], out[1], out[2], out[3]]) % 1_000_000
}

/// Passkey as the 128-bit `r` value used by f6 and legacy TK
pub fn passkey_to_128(passkey: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&passkey.to_le_bytes());
    out
}

/// Truncate a key to the negotiated encryption key size
pub fn truncate_key(key: &mut [u8; 16], key_size: u8) {
    for byte in key.iter_mut().skip(key_size as usize) {
        *byte = 0;
    }
}

/// Ephemeral P-256 key pair for LE Secure Connections
pub struct KeyPair {
    secret: SecretKey,
    /// Public key X coordinate, little-endian
    pub x: [u8; 32],
    /// Public key Y coordinate, little-endian
    pub y: [u8; 32],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("x", &hex::encode(self.x)).finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Build from a big-endian private scalar
    pub fn from_private_bytes(private_be: &[u8; 32]) -> SmpResult<Self> {
        let secret = SecretKey::from_slice(private_be).map_err(|e| SmpError::Crypto(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        // Uncompressed SEC1: 0x04 || X || Y, big-endian
        x.copy_from_slice(&point.as_bytes()[1..33]);
        y.copy_from_slice(&point.as_bytes()[33..65]);
        x.reverse();
        y.reverse();
        Self { secret, x, y }
    }

    /// ECDH with the peer's public key, returning the DHKey little-endian
    ///
    /// Points not on the curve are rejected.
    pub fn dhkey(&self, peer_x: &[u8; 32], peer_y: &[u8; 32]) -> SmpResult<[u8; 32]> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..33].copy_from_slice(&reversed(peer_x));
        sec1[33..65].copy_from_slice(&reversed(peer_y));
        let peer = PublicKey::from_sec1_bytes(&sec1).map_err(|_| SmpError::DhKeyCheckFailed)?;

        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        out.reverse();
        Ok(out)
    }
}
