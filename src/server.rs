//! The accept / dispatch loop.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    acceptor::Acceptor,
    config::ServerConfig,
    connection::Connection,
    dispatch::Dispatch,
    error::{Error, Result},
    poller::{EventKind, Poller, Ready},
    worker::{self, WorkerContext},
};

/// Pause before the server is rebuilt after a poller failure.
const RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct Server {
    poller: Arc<Poller<Connection>>,
    acceptor: Acceptor,
    dispatcher: Box<dyn Dispatch>,
    context: Arc<WorkerContext>,
    wait_timeout: Duration,
}

impl Server {
    /// Creates the poller, binds the listener and registers it.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let poller = Arc::new(Poller::new(config.event_capacity)?);
        let acceptor = Acceptor::bind(config)?;
        acceptor.register(&poller)?;
        let dispatcher = config.dispatch.build()?;

        Ok(Server {
            poller,
            acceptor,
            dispatcher,
            context: Arc::new(config.worker_context()),
            wait_timeout: config.wait_timeout(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Runs the loop until `shutdown` is set.
    ///
    /// Only a poller failure makes this return an error; everything that
    /// goes wrong with a single connection is handled here or in its worker.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            root = %self.context.root.display(),
            dispatch = self.dispatcher.name(),
            "listening"
        );

        while !shutdown.load(Ordering::Relaxed) {
            // We **only ever** touch a socket after epoll told us to.
            for ready in self.poller.wait(Some(self.wait_timeout))? {
                if ready.fd == self.acceptor.fd() {
                    self.acceptor.accept_pending(&self.poller);
                } else {
                    self.handle(ready);
                }
            }
        }

        info!("shutdown requested");
        Ok(())
    }

    fn handle(&self, ready: Ready<Connection>) {
        let Ready { fd, kind, payload } = ready;

        let Some(conn) = payload else {
            warn!(fd, "event without a connection");
            return;
        };

        match kind {
            // A hangup still goes to a worker: reading is how we find out
            // whether the peer left anything behind.
            EventKind::Readable | EventKind::Hangup => self.dispatch(conn),
            EventKind::Error => {
                debug!(fd, "socket error, dropping connection");
                if let Err(err) = self.poller.deregister(fd) {
                    warn!(fd, "{err}");
                }
                drop(conn);
            }
        }
    }

    /// Hands the connection to a worker.
    fn dispatch(&self, conn: Connection) {
        let fd = conn.fd();
        let poller = Arc::clone(&self.poller);
        let context = Arc::clone(&self.context);

        let job = Box::new(move || {
            let outcome = worker::run(conn, &poller, &context);
            debug!(fd, ?outcome, "worker finished");
        });

        if let Err(err) = self.dispatcher.dispatch(job) {
            // The job, and the connection with it, is gone.
            warn!(fd, "failed to dispatch worker: {err}");
            if let Err(err) = self.poller.deregister(fd) {
                warn!(fd, "{err}");
            }
        }
    }
}

/// Serves until `shutdown` is set, rebuilding the server from scratch
/// whenever the poller fails.
///
/// Failing to build the server in the first place is returned to the caller.
pub fn serve(config: &ServerConfig, shutdown: &AtomicBool) -> Result<()> {
    loop {
        let server = Server::bind(config)?;

        match server.run(shutdown) {
            Ok(()) => return Ok(()),
            Err(err @ Error::Poll(_)) => {
                error!("{err}, restarting");
                drop(server);
                thread::sleep(RESTART_DELAY);
            }
            Err(err) => return Err(err),
        }

        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
}
