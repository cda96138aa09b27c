//! H4 over a TCP bridge (e.g. an emulator or a remote UART server)

use crate::error::HciError;
use crate::transport::Transport;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

// Read timeout so the read loop can observe shutdown
const READ_TICK: Duration = Duration::from_millis(100);

/// TCP transport carrying H4 framed packets
#[derive(Debug)]
pub struct TcpTransport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl TcpTransport {
    /// Connect to a bridge listening at `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, HciError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Result<Self, HciError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TICK))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().unwrap().read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writer.lock().unwrap().write(buf)
    }

    fn close(&self) {
        // The writer half shares the socket, so this also wakes the reader
        let _ = self.writer.lock().unwrap().shutdown(Shutdown::Both);
    }
}
