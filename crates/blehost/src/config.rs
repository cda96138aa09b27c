//! Session configuration
//!
//! Every timeout and queue bound used by the session lives here so tests
//! can shrink them and applications can tune them in one place.

use crate::hci::{AdvertisingParameters, ConnectionParameters, ScanParameters};
use crate::l2cap::LeCreditBasedConfig;
use crate::smp::PairingConfig;
use std::time::Duration;

/// Configuration for a [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a command may wait for its Command Complete/Status before
    /// the transport is considered dead
    pub command_timeout: Duration,
    /// How long a command may wait for a controller command credit
    pub credit_timeout: Duration,
    /// How long a command may wait behind another command with the same opcode
    pub opcode_lock_timeout: Duration,
    /// Default timeout for `dial`
    pub dial_timeout: Duration,
    /// Connections accepted but not yet picked up by `accept`
    pub accept_queue_len: usize,
    /// Raw packets queued between the read loop and the dispatch loop
    pub packet_queue_len: usize,
    /// ACL fragments queued per connection ahead of reassembly
    pub acl_queue_len: usize,
    /// How long the dispatch loop waits on a full connection queue before
    /// tearing that connection down
    pub acl_queue_timeout: Duration,
    /// Complete ATT SDUs queued per connection ahead of `read`
    pub read_queue_len: usize,
    /// Buffer count used when the controller reports none
    pub acl_pool_fallback: usize,
    /// ACL payload size used when the controller reports none
    pub acl_mtu_fallback: usize,
    /// How long an outbound fragment may wait for a controller buffer
    pub acl_buffer_timeout: Duration,
    /// Parameters for `dial`
    pub connection: ConnectionParameters,
    /// Parameters for `start_advertising` when none are given
    pub advertising: AdvertisingParameters,
    /// Parameters for `start_scan` when none are given
    pub scan: ScanParameters,
    /// Defaults for LE credit based channels
    pub coc: LeCreditBasedConfig,
    /// Attempts made to obtain a send credit on a credit based channel
    pub coc_credit_attempts: u32,
    /// First backoff between credit attempts, doubled on each retry
    pub coc_credit_backoff: Duration,
    /// How long a reassembled SDU may wait for its reader or subscriber
    pub coc_deliver_timeout: Duration,
    /// How long a signaling request waits for its response
    pub signaling_timeout: Duration,
    /// Defaults for pairing, used for both `pair` and incoming requests
    pub pairing: PairingConfig,
    /// SMP transaction timer
    pub pairing_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            credit_timeout: Duration::from_secs(5),
            opcode_lock_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            accept_queue_len: 4,
            packet_queue_len: 64,
            acl_queue_len: 32,
            acl_queue_timeout: Duration::from_secs(1),
            read_queue_len: 16,
            acl_pool_fallback: 8,
            acl_mtu_fallback: 27,
            acl_buffer_timeout: Duration::from_secs(5),
            connection: ConnectionParameters::default(),
            advertising: AdvertisingParameters::default(),
            scan: ScanParameters::default(),
            coc: LeCreditBasedConfig::default(),
            coc_credit_attempts: 10,
            coc_credit_backoff: Duration::from_millis(20),
            coc_deliver_timeout: Duration::from_secs(1),
            signaling_timeout: Duration::from_secs(30),
            pairing: PairingConfig::default(),
            pairing_timeout: Duration::from_secs(30),
        }
    }
}
