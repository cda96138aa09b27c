//! Example: pairing and encryption
//!
//! Advertises on hci0, waits for a central, and either encrypts with a
//! stored bond or pairs using a passkey typed on stdin.

use blehost::smp::{AuthRequirements, IoCapability};
use blehost::{AuthData, BondStore, Config, HciSocket, PairingConfig, Session};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        pairing: PairingConfig {
            io_capability: IoCapability::KeyboardOnly,
            auth_req: AuthRequirements::BONDING | AuthRequirements::MITM | AuthRequirements::SECURE_CONNECTIONS,
            ..PairingConfig::default()
        },
        ..Config::default()
    };
    let session = Session::open(Arc::new(HciSocket::open(0)?), config)?;

    // Flags (LE General Discoverable, BR/EDR not supported) and a name
    let mut adv = vec![0x02, 0x01, 0x06];
    let name = b"blehost";
    adv.push(name.len() as u8 + 1);
    adv.push(0x09);
    adv.extend_from_slice(name);
    session.set_advertising_data(&adv, &[])?;
    session.start_advertising(None)?;
    println!("Advertising as {} ({})", String::from_utf8_lossy(name), session.local_address());

    let conn = session.accept(None)?;
    println!("Central {} connected", conn.peer_address());

    let passkey = if session.bond_store().exists(&conn.peer_address()) {
        None
    } else {
        println!("Enter the passkey shown on the central:");
        let line = io::stdin().lock().lines().next().transpose()?.unwrap_or_default();
        Some(line.trim().parse::<u32>()?)
    };
    conn.set_auth(AuthData {
        passkey,
        ..AuthData::default()
    });

    let level = conn.start_encryption(Duration::from_secs(60))?;
    println!("Link encrypted at {:?}", level);

    conn.disconnected().recv().ok();
    println!("Central disconnected");
    Ok(())
}
