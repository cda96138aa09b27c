//! HCI command engine
//!
//! Commands are correlated with their Command Complete/Status by opcode,
//! so at most one command per opcode may be outstanding. A caller first
//! takes the opcode's lock, then a controller command credit, and only
//! then writes the packet. The credit count is global and follows the
//! Num_HCI_Command_Packets field of every Complete/Status event.

use crate::error::HciError;
use crate::hci::event::{CommandComplete, CommandStatus};
use crate::hci::HciCommand;
use crate::transport::{self, Transport};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Answer to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub opcode: u16,
    pub status: u8,
    /// Return parameters of a Command Complete, status byte first; empty
    /// for commands answered by Command Status
    pub return_parameters: Vec<u8>,
}

impl CommandResponse {
    /// Return parameters after the status byte
    pub fn payload(&self) -> &[u8] {
        self.return_parameters.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug)]
struct Credits {
    available: usize,
    closed: bool,
}

/// Controller command credits
#[derive(Debug)]
pub(crate) struct CreditPool {
    state: Mutex<Credits>,
    changed: Condvar,
}

impl CreditPool {
    /// Controllers accept one command before their first event
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Credits {
                available: 1,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn take(&self, opcode: u16, timeout: Duration) -> Result<(), HciError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(HciError::Closed);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HciError::CreditTimeout { opcode });
            }
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Put back a credit taken by a command that was never written
    pub fn restore(&self) {
        let mut state = self.state.lock().unwrap();
        state.available += 1;
        self.changed.notify_one();
    }

    /// Adopt the controller's current window
    pub fn set(&self, available: usize) {
        let mut state = self.state.lock().unwrap();
        state.available = available;
        if available > 0 {
            self.changed.notify_all();
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().available
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.changed.notify_all();
    }
}

/// Held while a command with this opcode is outstanding
struct OpcodeGuard {
    token: Receiver<()>,
}

impl Drop for OpcodeGuard {
    fn drop(&mut self) {
        let _ = self.token.try_recv();
    }
}

/// One single-slot channel per opcode; a full slot means the opcode is taken
#[derive(Default)]
struct OpcodeLocks {
    slots: Mutex<HashMap<u16, (Sender<()>, Receiver<()>)>>,
}

impl OpcodeLocks {
    fn lock(&self, opcode: u16, timeout: Duration, done: &Receiver<()>) -> Result<OpcodeGuard, HciError> {
        let (tx, rx) = self
            .slots
            .lock()
            .unwrap()
            .entry(opcode)
            .or_insert_with(|| bounded(1))
            .clone();
        select! {
            send(tx, ()) -> res => match res {
                Ok(()) => Ok(OpcodeGuard { token: rx }),
                Err(_) => Err(HciError::Closed),
            },
            recv(done) -> _ => Err(HciError::Closed),
            default(timeout) => Err(HciError::OpcodeBusy { opcode }),
        }
    }
}

/// Serialises commands to the controller and correlates their answers
pub struct CommandEngine {
    transport: Arc<dyn Transport>,
    writer: Mutex<()>,
    credits: CreditPool,
    locks: OpcodeLocks,
    pending: Mutex<HashMap<u16, Sender<CommandResponse>>>,
    done: Receiver<()>,
    command_timeout: Duration,
    credit_timeout: Duration,
    lock_timeout: Duration,
}

impl CommandEngine {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        done: Receiver<()>,
        command_timeout: Duration,
        credit_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            writer: Mutex::new(()),
            credits: CreditPool::new(),
            locks: OpcodeLocks::default(),
            pending: Mutex::new(HashMap::new()),
            done,
            command_timeout,
            credit_timeout,
            lock_timeout,
        }
    }

    /// Write one whole packet; packets from different threads never interleave
    pub fn write_packet(&self, packet: &[u8]) -> Result<(), HciError> {
        let _guard = self.writer.lock().unwrap();
        transport::write_all(self.transport.as_ref(), packet)
    }

    /// Send a command and wait for its Command Complete or Command Status
    ///
    /// A non-zero status is returned as `CommandFailed`. Missing the answer
    /// past the command timeout means the controller is gone: the transport
    /// is closed, which ends the session.
    pub fn send(&self, command: &HciCommand) -> Result<CommandResponse, HciError> {
        let opcode = command.opcode();
        let _guard = self.locks.lock(opcode, self.lock_timeout, &self.done)?;
        self.credits.take(opcode, self.credit_timeout)?;

        let (tx, rx) = bounded(1);
        self.pending.lock().unwrap().insert(opcode, tx);
        trace!("command 0x{:04x} -> controller", opcode);
        if let Err(err) = self.write_packet(&command.to_packet()) {
            self.pending.lock().unwrap().remove(&opcode);
            self.credits.restore();
            return Err(err);
        }

        let response = select! {
            recv(rx) -> res => res.map_err(|_| HciError::Closed)?,
            recv(self.done) -> _ => {
                self.pending.lock().unwrap().remove(&opcode);
                return Err(HciError::Closed);
            }
            default(self.command_timeout) => {
                self.pending.lock().unwrap().remove(&opcode);
                error!("command 0x{:04x} unanswered after {:?}, closing transport", opcode, self.command_timeout);
                self.transport.close();
                return Err(HciError::CommandTimeout { opcode });
            }
        };

        if response.status != crate::hci::constants::HCI_SUCCESS {
            debug!("command 0x{:04x} failed with status 0x{:02x}", opcode, response.status);
            return Err(HciError::CommandFailed {
                opcode,
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Write a command without waiting for it or for a credit
    ///
    /// Only used for the best-effort disconnects sent while closing.
    pub(crate) fn post(&self, command: &HciCommand) -> Result<(), HciError> {
        self.write_packet(&command.to_packet())
    }

    pub(crate) fn on_command_complete(&self, event: CommandComplete) {
        self.credits.set(event.num_hci_command_packets as usize);
        let response = CommandResponse {
            opcode: event.opcode,
            status: event.status(),
            return_parameters: event.return_parameters,
        };
        self.complete(response);
    }

    pub(crate) fn on_command_status(&self, event: CommandStatus) {
        self.credits.set(event.num_hci_command_packets as usize);
        self.complete(CommandResponse {
            opcode: event.opcode,
            status: event.status,
            return_parameters: Vec::new(),
        });
    }

    fn complete(&self, response: CommandResponse) {
        // Opcode 0 only carries credits
        if response.opcode == 0 {
            return;
        }
        let waiter = self.pending.lock().unwrap().remove(&response.opcode);
        match waiter {
            Some(tx) => {
                let _ = tx.try_send(response);
            }
            None => warn!("unsolicited answer for command 0x{:04x}", response.opcode),
        }
    }

    pub fn credits(&self) -> usize {
        self.credits.available()
    }

    /// Fail every caller waiting on a credit or an answer
    pub(crate) fn close(&self) {
        self.credits.close();
        self.pending.lock().unwrap().clear();
    }
}
