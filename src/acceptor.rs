use std::{
    io,
    net::{SocketAddr, TcpListener},
    os::fd::{AsRawFd, RawFd},
};

use tracing::{debug, warn};

use crate::{
    config::ServerConfig,
    connection::Connection,
    error::{Error, Result},
    poller::{Mode, Poller},
};

/// Owns the listening socket and turns its readiness into registered
/// connections. It never touches peer data.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Binds to the configured address, non-blocking, with the configured
    /// backlog.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = config.address();
        let bind_error = |err| Error::Bind {
            addr: addr.clone(),
            err,
        };

        // `SO_REUSEADDR` is set for us on unix.
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        // Calling listen again on a listening socket only updates the
        // backlog, which std does not let us choose.
        if unsafe { libc::listen(listener.as_raw_fd(), config.backlog) } < 0 {
            return Err(bind_error(io::Error::last_os_error()));
        }

        Ok(Acceptor { listener })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registers the listener: edge-triggered, never one-shot, since only
    /// the loop thread ever accepts.
    pub fn register(&self, poller: &Poller<Connection>) -> Result<()> {
        poller
            .register(self.fd(), Mode::Edge, None)
            .map(drop)
    }

    /// Accepts every pending connection and registers each one-shot.
    ///
    /// Edge-triggered readiness only fires once per burst of arrivals, so
    /// this keeps going until the listener would block. Returns the number
    /// of connections registered.
    pub fn accept_pending(&self, poller: &Poller<Connection>) -> usize {
        let mut accepted = 0;

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Usually EMFILE / ENFILE. The pending peer stays queued
                    // and a later arrival will wake us up again.
                    warn!("failed to accept: {err}");
                    break;
                }
            };

            if let Err(err) = stream.set_nonblocking(true) {
                warn!(%peer, "failed to set non-blocking: {err}");
                continue;
            }

            let conn = Connection::new(stream, peer);
            let fd = conn.fd();
            match poller.register(fd, Mode::OneShot, Some(conn)) {
                Ok(_) => {
                    debug!(fd, %peer, "accepted");
                    accepted += 1;
                }
                // The connection was dropped with the failed registration.
                Err(err) => warn!(%peer, "{err}"),
            }
        }

        accepted
    }
}
