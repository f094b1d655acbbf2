use std::{io, os::fd::RawFd};

/// Everything that can go wrong outside of a single connection.
///
/// Failures that only affect one peer (a reset, a bad request line, a missing
/// file) never become an `Error`: the worker logs them and retires the
/// connection.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The command line or environment produced an unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Creating, binding or listening on the server socket failed.
    #[error("failed to bind {addr}: {err}")]
    Bind { addr: String, err: io::Error },
    /// A register / re-arm / deregister call was rejected.
    #[error("registration of fd {fd} failed: {reason}")]
    Registration { fd: RawFd, reason: String },
    /// `epoll` itself failed. The accept loop cannot continue.
    #[error("poller failure: {0}")]
    Poll(io::Error),
    /// Detaching from the controlling terminal failed.
    #[error("failed to daemonize: {0}")]
    Daemon(io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn registration(fd: RawFd, reason: impl ToString) -> Self {
        Error::Registration {
            fd,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
