//! LE credit based connection oriented channels
//!
//! [`CocEngine`] keeps the per-connection table of open channels keyed by
//! local CID. It owns the credit accounting in both directions and the
//! inbound SDU reassembly; the connection performs the signaling exchange
//! and the actual writes.

use super::constants::*;
use super::types::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Parameters negotiated for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CocChannelInfo {
    pub psm: u16,
    pub local_cid: u16,
    pub remote_cid: u16,
    /// What we accept
    pub local_mtu: u16,
    pub local_mps: u16,
    /// What the peer accepts
    pub remote_mtu: u16,
    pub remote_mps: u16,
    /// Credits the peer granted us
    pub send_credits: u16,
}

/// SDU being reassembled from K-frames
#[derive(Debug)]
struct SduAssembly {
    expected: usize,
    buf: Vec<u8>,
}

#[derive(Debug)]
struct CocChannel {
    info: CocChannelInfo,
    credits: Credits,
    rx: Option<SduAssembly>,
    subscriber: Option<Sender<Vec<u8>>>,
}

/// A K-frame consumed by the engine
#[derive(Debug)]
pub struct Received {
    /// Our CID, echoed in the LE Flow Control Credit returning the frame's credit
    pub local_cid: u16,
    /// A completed SDU and where it should go
    pub sdu: Option<(Vec<u8>, Option<Sender<Vec<u8>>>)>,
}

#[derive(Debug)]
struct CocState {
    channels: HashMap<u16, CocChannel>,
    next_cid: u16,
    closed: bool,
}

/// Credit based channels of one connection
#[derive(Debug)]
pub struct CocEngine {
    state: Mutex<CocState>,
    credit_granted: Condvar,
    queue_len: usize,
}

impl CocEngine {
    /// `queue_len` bounds each subscriber's queue of complete SDUs
    pub fn new(queue_len: usize) -> Self {
        Self {
            state: Mutex::new(CocState {
                channels: HashMap::new(),
                next_cid: L2CAP_LE_DYN_CID_START,
                closed: false,
            }),
            credit_granted: Condvar::new(),
            queue_len: queue_len.max(1),
        }
    }

    /// Allocate the next unused local CID in the dynamic range
    ///
    /// Allocation moves forward monotonically and wraps at the end of the
    /// range; the CID is not reserved until `register`.
    pub fn allocate_cid(&self) -> L2capResult<u16> {
        let mut state = self.state.lock().unwrap();
        let span = L2CAP_LE_DYN_CID_END - L2CAP_LE_DYN_CID_START + 1;
        for _ in 0..span {
            let cid = state.next_cid;
            state.next_cid = if cid >= L2CAP_LE_DYN_CID_END {
                L2CAP_LE_DYN_CID_START
            } else {
                cid + 1
            };
            if !state.channels.contains_key(&cid) {
                return Ok(cid);
            }
        }
        Err(L2capError::ResourceLimitReached)
    }

    /// Register an opened channel
    pub fn register(&self, info: CocChannelInfo) -> L2capResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(L2capError::ConnectionTerminated);
        }
        if state.channels.contains_key(&info.local_cid) {
            return Err(L2capError::DuplicateChannel(info.local_cid));
        }
        debug!(
            "CoC 0x{:04x} -> 0x{:04x} open (psm 0x{:04x}, mtu {}, mps {}, credits {})",
            info.local_cid, info.remote_cid, info.psm, info.remote_mtu, info.remote_mps, info.send_credits
        );
        state.channels.insert(
            info.local_cid,
            CocChannel {
                info,
                credits: Credits::new(info.send_credits),
                rx: None,
                subscriber: None,
            },
        );
        Ok(())
    }

    pub fn info(&self, local_cid: u16) -> L2capResult<CocChannelInfo> {
        let state = self.state.lock().unwrap();
        let channel = state
            .channels
            .get(&local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;
        let mut info = channel.info;
        info.send_credits = channel.credits.available();
        Ok(info)
    }

    /// Local CID of the channel whose peer end is `remote_cid`
    pub fn local_for_remote(&self, remote_cid: u16) -> Option<u16> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .values()
            .find(|c| c.info.remote_cid == remote_cid)
            .map(|c| c.info.local_cid)
    }

    /// Take one send credit, waiting with exponential backoff between attempts
    pub fn acquire_credit(&self, local_cid: u16, attempts: u32, backoff: Duration) -> L2capResult<()> {
        let mut state = self.state.lock().unwrap();
        let mut wait = backoff;
        for attempt in 0..attempts.max(1) {
            if state.closed {
                return Err(L2capError::ConnectionTerminated);
            }
            let channel = state
                .channels
                .get_mut(&local_cid)
                .ok_or(L2capError::ChannelNotFound(local_cid))?;
            if channel.credits.try_take() {
                return Ok(());
            }
            if attempt + 1 == attempts.max(1) {
                break;
            }
            state = self.credit_granted.wait_timeout(state, wait).unwrap().0;
            wait = wait.saturating_mul(2);
        }
        Err(L2capError::NoCredits(local_cid))
    }

    /// Apply an LE Flow Control Credit from the peer
    ///
    /// `remote_cid` is the peer's CID as carried in the packet. Overflowing
    /// 65535 credits is a protocol violation; the count is left unchanged.
    pub fn grant(&self, remote_cid: u16, credits: u16) -> L2capResult<u16> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .values_mut()
            .find(|c| c.info.remote_cid == remote_cid)
            .ok_or(L2capError::ChannelNotFound(remote_cid))?;
        let local_cid = channel.info.local_cid;
        let total = channel.credits.grant(credits).ok_or_else(|| {
            warn!("CoC 0x{:04x}: credit overflow (+{})", local_cid, credits);
            L2capError::CreditOverflow(local_cid)
        })?;
        self.credit_granted.notify_all();
        Ok(total)
    }

    /// Consume one inbound K-frame
    ///
    /// The first frame of an SDU declares its total length. A completed SDU
    /// is returned together with the subscriber to deliver it to; overrun
    /// past the declared length is logged and delivered as is.
    pub fn receive(&self, local_cid: u16, frame: &[u8]) -> L2capResult<Received> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .get_mut(&local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;

        if frame.len() > channel.info.local_mps as usize {
            warn!(
                "CoC 0x{:04x}: frame of {} bytes exceeds MPS {}",
                local_cid,
                frame.len(),
                channel.info.local_mps
            );
        }

        let assembly = match channel.rx.take() {
            Some(mut assembly) => {
                assembly.buf.extend_from_slice(frame);
                assembly
            }
            None => {
                if frame.len() < L2CAP_SDU_LENGTH_SIZE {
                    return Err(L2capError::InvalidParameter(format!(
                        "CoC 0x{:04x}: first frame without SDU length",
                        local_cid
                    )));
                }
                let expected = u16::from_le_bytes([frame[0], frame[1]]) as usize;
                if expected > channel.info.local_mtu as usize {
                    warn!(
                        "CoC 0x{:04x}: SDU length {} exceeds MTU {}",
                        local_cid, expected, channel.info.local_mtu
                    );
                }
                SduAssembly {
                    expected,
                    buf: frame[L2CAP_SDU_LENGTH_SIZE..].to_vec(),
                }
            }
        };

        let sdu = if assembly.buf.len() >= assembly.expected {
            if assembly.buf.len() > assembly.expected {
                warn!(
                    "CoC 0x{:04x}: SDU overran declared length ({} > {})",
                    local_cid,
                    assembly.buf.len(),
                    assembly.expected
                );
            }
            Some((assembly.buf, channel.subscriber.clone()))
        } else {
            channel.rx = Some(assembly);
            None
        };

        Ok(Received { local_cid, sdu })
    }

    /// Attach the channel's single subscriber, replacing any previous one
    pub fn subscribe(&self, local_cid: u16) -> L2capResult<Receiver<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .get_mut(&local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;
        let (tx, rx) = bounded(self.queue_len);
        channel.subscriber = Some(tx);
        Ok(rx)
    }

    /// Release the subscriber; its receiver observes disconnection
    pub fn unsubscribe(&self, local_cid: u16) -> L2capResult<()> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .get_mut(&local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;
        channel.subscriber = None;
        Ok(())
    }

    /// Unregister a channel, closing its subscriber
    pub fn remove(&self, local_cid: u16) -> L2capResult<CocChannelInfo> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .remove(&local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;
        self.credit_granted.notify_all();
        Ok(channel.info)
    }

    /// Drop every channel when the link goes away
    pub fn close_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.channels.clear();
        self.credit_granted.notify_all();
    }
}
