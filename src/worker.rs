//! The per-event connection worker.
//!
//! A worker owns its [`Connection`] from the moment the poller hands it out
//! until it either gives it back through [`Poller::rearm`] or closes it.

use std::{
    io::{self, Read},
    net::{Shutdown, TcpStream},
    path::PathBuf,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    connection::Connection,
    handler,
    http::{self, Response},
    poller::Poller,
};

/// Upper bound on how long an answered peer is drained before the close.
const LINGER: Duration = Duration::from_millis(500);

/// What a worker needs to know about the server. Nothing else is shared.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub root: PathBuf,
    pub chunk_size: usize,
    pub max_request_bytes: usize,
}

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response with this status was written and the connection closed.
    Responded(u16),
    /// The request is not complete yet; the connection went back to the
    /// poller and will be resumed by a later event.
    Rearmed,
    /// The peer closed its side before sending a complete request.
    PeerClosed,
    /// Reading, re-arming or writing failed and the connection was dropped.
    Failed,
}

/// Drains `conn` until the socket would block, then either answers the
/// request or re-arms the connection.
pub fn run(
    mut conn: Connection,
    poller: &Poller<Connection>,
    context: &WorkerContext,
) -> Outcome {
    let fd = conn.fd();
    debug!(fd, peer = %conn.peer(), "worker started");

    let mut chunk = vec![0u8; context.chunk_size.max(1)];

    loop {
        match conn.stream().read(&mut chunk) {
            Ok(0) => {
                debug!(fd, "peer closed the connection");
                retire(conn, poller);
                return Outcome::PeerClosed;
            }
            Ok(n) => {
                conn.append(&chunk[..n]);

                if conn.buffer().len() > context.max_request_bytes {
                    warn!(fd, len = conn.buffer().len(), "request too large");
                    return respond(conn, poller, Response::BadRequest);
                }
            }
            // Nothing more to read for now. This is the only place where
            // edge-triggered readiness is exhausted.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(fd, "read failed: {err}");
                retire(conn, poller);
                return Outcome::Failed;
            }
        }
    }

    if !http::is_complete(conn.buffer()) {
        // Hand the connection back and let the next readiness event resume
        // from the same buffer.
        return match poller.rearm(fd, conn) {
            Ok(()) => {
                debug!(fd, "request incomplete, re-armed");
                Outcome::Rearmed
            }
            Err(err) => {
                warn!(fd, "{err}");
                Outcome::Failed
            }
        };
    }

    let response = handler::respond(conn.buffer(), &context.root);
    respond(conn, poller, response)
}

/// Writes `response` and closes the connection. There is no keep-alive, so
/// a connection that was answered is never re-armed.
fn respond(
    mut conn: Connection,
    poller: &Poller<Connection>,
    response: Response,
) -> Outcome {
    let fd = conn.fd();
    let status = response.status();

    // The poller must forget the descriptor before the socket is closed,
    // otherwise the number could be handed out again while still listed.
    if let Err(err) = poller.deregister(fd) {
        warn!(fd, "{err}");
    }

    // Block for the write so that large files go out in one piece.
    let written = conn
        .stream()
        .set_nonblocking(false)
        .and_then(|()| response.write_to(conn.stream()));

    match written {
        Ok(()) => {
            debug!(fd, status, bytes = response.body().len(), "responded");
            linger(conn.stream());
            Outcome::Responded(status)
        }
        Err(err) => {
            debug!(fd, status, "write failed: {err}");
            Outcome::Failed
        }
    }
}

/// Sends our FIN, then reads and discards whatever the peer still sends
/// (typically the headers after the request line) until it closes or
/// [`LINGER`] runs out. Closing with unread input would make the kernel
/// reset the connection, which can cut off a response still in flight.
fn linger(stream: &mut TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err() {
        return;
    }

    let deadline = Instant::now() + LINGER;
    let mut sink = [0u8; 512];

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() || stream.set_read_timeout(Some(left)).is_err() {
            return;
        }
        match stream.read(&mut sink) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

/// Closes a connection without answering.
fn retire(conn: Connection, poller: &Poller<Connection>) {
    if let Err(err) = poller.deregister(conn.fd()) {
        warn!(fd = conn.fd(), "{err}");
    }
    drop(conn);
}
