//! H4 over a serial line

use crate::error::HciError;
use crate::transport::Transport;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// UART transport carrying H4 framed packets
///
/// The tty is put into raw mode with an inter-byte timer of 100 ms
/// (`VMIN = 0`, `VTIME = 1`) so an idle read returns instead of blocking.
#[derive(Debug)]
pub struct UartTransport {
    fd: RawFd,
    closed: AtomicBool,
}

fn baud_constant(baud: u32) -> Result<libc::speed_t, HciError> {
    Ok(match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        460800 => libc::B460800,
        921600 => libc::B921600,
        1000000 => libc::B1000000,
        2000000 => libc::B2000000,
        3000000 => libc::B3000000,
        _ => return Err(HciError::Unsupported),
    })
}

impl UartTransport {
    /// Open `path` (e.g. `/dev/ttyUSB0`) at the given baud rate with RTS/CTS
    pub fn open(path: &str, baud: u32) -> Result<Self, HciError> {
        let speed = baud_constant(baud)?;
        let c_path = CString::new(path).map_err(|_| HciError::InvalidPacketFormat)?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(HciError::SocketError(io::Error::last_os_error()));
        }

        if let Err(e) = Self::configure(fd, speed) {
            unsafe { libc::close(fd) };
            return Err(HciError::BindError(e));
        }

        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    fn configure(fd: RawFd, speed: libc::speed_t) -> io::Result<()> {
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe { libc::cfmakeraw(&mut tio) };
        tio.c_cflag |= libc::CLOCAL | libc::CREAD | libc::CRTSCTS;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 1;

        unsafe {
            if libc::cfsetispeed(&mut tio, speed) < 0 || libc::cfsetospeed(&mut tio, speed) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::tcflush(fd, libc::TCIOFLUSH);
        }
        Ok(())
    }
}

impl Transport for UartTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        match n {
            n if n < 0 => Err(io::Error::last_os_error()),
            // VTIME expired with nothing received
            0 => Err(io::Error::new(io::ErrorKind::TimedOut, "uart idle")),
            n => Ok(n as usize),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "uart closed"));
        }
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for UartTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
