//! Where workers run.
//!
//! The accept loop only ever calls [`Dispatch::dispatch`]; it does not care
//! whether the job lands on a fresh thread or on a pooled one.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use tokio::runtime::{Builder, Runtime};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatch: Send + Sync {
    /// Runs `job` somewhere other than the calling thread.
    fn dispatch(&self, job: Job) -> io::Result<()>;

    fn name(&self) -> &'static str;
}

/// The available strategies, selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Strategy {
    /// One new OS thread per event, exiting when the worker is done.
    Thread,
    /// Jobs run on the blocking pool of a tokio runtime.
    Tokio,
}

impl Strategy {
    pub fn build(self) -> io::Result<Box<dyn Dispatch>> {
        Ok(match self {
            Strategy::Thread => Box::new(ThreadPerEvent::new()),
            Strategy::Tokio => Box::new(TokioBlocking::new()?),
        })
    }
}

/// Spawns an unpooled, named thread for every job.
#[derive(Debug, Default)]
pub struct ThreadPerEvent {
    spawned: AtomicU64,
}

impl ThreadPerEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatch for ThreadPerEvent {
    fn dispatch(&self, job: Job) -> io::Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);

        // The join handle is dropped, the thread runs detached.
        thread::Builder::new()
            .name(format!("worker-{n}"))
            .spawn(job)
            .map(drop)
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}

/// Hands jobs to tokio's blocking thread pool, which caps the number of
/// threads and reuses idle ones.
pub struct TokioBlocking {
    runtime: Option<Runtime>,
}

impl TokioBlocking {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("edgeserve-blocking")
            .enable_all()
            .build()?;

        Ok(TokioBlocking {
            runtime: Some(runtime),
        })
    }
}

impl Dispatch for TokioBlocking {
    fn dispatch(&self, job: Job) -> io::Result<()> {
        match &self.runtime {
            Some(runtime) => {
                drop(runtime.spawn_blocking(job));
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "runtime shut down")),
        }
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

impl Drop for TokioBlocking {
    fn drop(&mut self) {
        // A worker stuck on a silent peer must not hold up shutdown.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
