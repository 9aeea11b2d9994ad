use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr,
};

use tokio::{io::Interest, net::TcpStream};

use super::{pump_channels, Channel, Pump};
use crate::client::Client;

pub const NAME: &str = "splice";

const SPLICE_CHUNK: usize = 64 * 1024;

/// Moves bytes through a kernel pipe with `splice(2)`, never copying them
/// into userspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplicePump;

impl Pump for SplicePump {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn relay(&self, client: &mut Client) -> crate::Result<()> {
        pump_channels(client, Pipe::new()?, Pipe::new()?).await
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
    pending: usize,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            read,
            write,
            pending: 0,
        })
    }
}

fn splice(from: &impl AsRawFd, to: &impl AsRawFd, len: usize) -> io::Result<usize> {
    // SAFETY: plain descriptors and null offsets, nothing is borrowed by the kernel.
    let n = unsafe {
        libc::splice(
            from.as_raw_fd(),
            ptr::null_mut(),
            to.as_raw_fd(),
            ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl Channel for Pipe {
    // A full pipe and an empty socket both report EAGAIN, so the socket is
    // only read from once the pipe is empty.
    fn has_room(&self) -> bool {
        self.pending == 0
    }

    fn has_pending(&self) -> bool {
        self.pending > 0
    }

    fn fill(&mut self, from: &TcpStream) -> io::Result<usize> {
        let n = from.try_io(Interest::READABLE, || splice(from, &self.write, SPLICE_CHUNK))?;
        self.pending += n;
        Ok(n)
    }

    fn drain(&mut self, to: &TcpStream) -> io::Result<usize> {
        let n = to.try_io(Interest::WRITABLE, || splice(&self.read, to, self.pending))?;
        self.pending -= n;
        Ok(n)
    }
}
