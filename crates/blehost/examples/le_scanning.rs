//! Example: LE Scanning
//!
//! Scans for advertising devices on hci0 for ten seconds and prints each
//! report. Requires root (or CAP_NET_ADMIN) and a powered-down adapter.

use blehost::{Config, HciSocket, Session};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Opening HCI user channel for device 0...");
    let socket = HciSocket::open(0)?;
    let session = Session::open(Arc::new(socket), Config::default())?;
    println!("Controller address: {}", session.local_address());

    session.set_advertisement_handler(|adv| {
        println!(
            "{} rssi={} type=0x{:02x} data={}",
            adv.address,
            adv.rssi,
            adv.event_type,
            hex::encode(&adv.data)
        );
    });

    session.start_scan(None)?;
    println!("Scanning for 10 seconds...");
    thread::sleep(Duration::from_secs(10));
    session.stop_scan()?;
    println!("Stopped scanning");

    session.close();
    Ok(())
}
