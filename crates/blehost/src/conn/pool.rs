//! Controller ACL buffer accounting
//!
//! The controller advertises a fixed number of ACL buffers shared by every
//! link. One buffer is taken per outbound fragment and given back when the
//! controller reports the fragment as completed. Buffers held by a link
//! that goes away are reclaimed under the same lock that hands them out,
//! so a writer racing with teardown either gets a buffer before the
//! reclaim or fails fast after it.

use crate::l2cap::{L2capError, L2capResult};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PoolState {
    free: usize,
    capacity: usize,
    in_flight: HashMap<u16, usize>,
    closed: HashSet<u16>,
    shutdown: bool,
}

/// Shared pool of controller ACL buffers
#[derive(Debug)]
pub struct AclPool {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl AclPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: capacity,
                capacity,
                in_flight: HashMap::new(),
                closed: HashSet::new(),
                shutdown: false,
            }),
            freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().free
    }

    /// Buffers currently held by `handle`
    pub fn in_flight(&self, handle: u16) -> usize {
        self.state.lock().unwrap().in_flight.get(&handle).copied().unwrap_or(0)
    }

    /// Adopt the buffer count reported by the controller
    pub fn resize(&self, capacity: usize) {
        let mut state = self.state.lock().unwrap();
        let held: usize = state.in_flight.values().sum();
        state.capacity = capacity;
        state.free = capacity.saturating_sub(held);
        debug!("ACL pool sized to {} buffers", capacity);
        self.freed.notify_all();
    }

    /// Start accounting for a new link
    pub fn open(&self, handle: u16) {
        let mut state = self.state.lock().unwrap();
        state.closed.remove(&handle);
        state.in_flight.entry(handle).or_insert(0);
    }

    /// Take one buffer for `handle`, waiting up to `timeout`
    pub fn acquire(&self, handle: u16, timeout: Duration) -> L2capResult<()> {
        self.acquire_n(handle, 1, Some(timeout)).map(|_| ())
    }

    /// Take up to `count` buffers for `handle` in one step
    ///
    /// The request is capped at the pool capacity. Either every buffer is
    /// taken or none is. Without a timeout the call waits until buffers
    /// come back or the link goes away. Returns the number taken.
    pub fn acquire_n(&self, handle: u16, count: usize, timeout: Option<Duration>) -> L2capResult<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown || state.closed.contains(&handle) || !state.in_flight.contains_key(&handle) {
                return Err(L2capError::ConnectionTerminated);
            }
            let wanted = count.min(state.capacity).max(1);
            if state.free >= wanted {
                state.free -= wanted;
                if let Some(held) = state.in_flight.get_mut(&handle) {
                    *held += wanted;
                }
                trace!("{} ACL buffers taken by 0x{:04x}, {} left", wanted, handle, state.free);
                return Ok(wanted);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(L2capError::NoBuffer);
                    }
                    self.freed.wait_timeout(state, deadline - now).unwrap().0
                }
                None => self.freed.wait(state).unwrap(),
            };
        }
    }

    /// Return buffers the controller reported as completed, or that were
    /// reserved and never written
    ///
    /// Counts for links already reclaimed are ignored.
    pub fn release(&self, handle: u16, count: usize) {
        let mut state = self.state.lock().unwrap();
        let returned = match state.in_flight.get_mut(&handle) {
            Some(held) => {
                let n = count.min(*held);
                *held -= n;
                n
            }
            None => 0,
        };
        if returned > 0 {
            state.free = (state.free + returned).min(state.capacity);
            self.freed.notify_all();
        }
    }

    /// Give back everything `handle` holds and refuse further acquisitions
    pub fn reclaim(&self, handle: u16) -> usize {
        let mut state = self.state.lock().unwrap();
        let held = state.in_flight.remove(&handle).unwrap_or(0);
        state.closed.insert(handle);
        state.free = (state.free + held).min(state.capacity);
        self.freed.notify_all();
        if held > 0 {
            debug!("reclaimed {} ACL buffers from 0x{:04x}", held, handle);
        }
        held
    }

    /// Fail every waiter; used when the session closes
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.freed.notify_all();
    }
}
