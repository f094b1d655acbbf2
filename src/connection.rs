use std::{
    net::{SocketAddr, TcpStream},
    os::fd::{AsRawFd, RawFd},
};

/// An accepted peer and everything it has sent so far.
///
/// A `Connection` is either parked inside the poller (armed) or owned by
/// exactly one worker. It is closed by dropping it.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            stream,
            peer,
            buffer: Vec::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bytes received so far, in arrival order.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}
