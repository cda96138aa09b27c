//! Example: LE credit based channel
//!
//! Connects to a peer through a TCP bridge to a controller, opens a credit
//! based channel and echoes back whatever the peer sends.
//!
//! Usage: l2cap_le_credit <bridge host:port> <peer address> [psm]

use blehost::{Address, Config, Session, TcpTransport};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <host:port> <peer> [psm]", args[0]);
        std::process::exit(2);
    }
    let peer = Address::from_str(&args[2])?;
    let psm = match args.get(3) {
        Some(psm) => u16::from_str_radix(psm.trim_start_matches("0x"), 16)?,
        None => 0x0080,
    };

    let transport = TcpTransport::connect(&args[1])?;
    let session = Session::open(Arc::new(transport), Config::default())?;
    session.set_error_handler(|err| eprintln!("session error: {}", err));

    println!("Connecting to {}...", peer);
    let conn = session.dial(peer, None)?;
    println!("Connected, handle 0x{:04x}", conn.handle());

    let channel = conn.coc_open(psm, None, Duration::from_secs(10))?;
    println!(
        "Channel open: local CID 0x{:04x}, remote CID 0x{:04x}, MTU {}, {} credits",
        channel.local_cid, channel.remote_cid, channel.remote_mtu, channel.send_credits
    );

    let inbound = conn.coc_subscribe(channel.local_cid)?;
    conn.coc_send(channel.local_cid, b"hello from blehost")?;

    let disconnected = conn.disconnected();
    loop {
        crossbeam_channel::select! {
            recv(inbound) -> sdu => match sdu {
                Ok(sdu) => {
                    println!("Received {} bytes: {}", sdu.len(), String::from_utf8_lossy(&sdu));
                    conn.coc_send(channel.local_cid, &sdu)?;
                }
                Err(_) => break,
            },
            recv(disconnected) -> _ => break,
        }
    }

    println!("Link closed");
    Ok(())
}
