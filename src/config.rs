//! Server configuration, read once at startup from the command line and the
//! environment.
//!
//! ```bash
//! edgeserve -h 127.0.0.1 -p 8080 -d /srv/www
//! EDGESERVE_DIRECTORY=/srv/www edgeserve --foreground --dispatch tokio
//! ```

use std::{
    env,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use crate::{
    dispatch::Strategy,
    error::{Error, Result},
    worker::WorkerContext,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "edgeserve", version)]
#[command(about = "Serves files from a directory over HTTP/1.0")]
#[command(disable_help_flag = true)]
pub struct ServerConfig {
    /// Address to bind
    #[arg(short = 'h', long, default_value = "0.0.0.0", env = "EDGESERVE_HOST")]
    pub host: String,

    /// Port to bind
    #[arg(short, long, default_value_t = 8080, env = "EDGESERVE_PORT")]
    pub port: u16,

    /// Document root
    #[arg(short = 'd', long = "directory", env = "EDGESERVE_DIRECTORY")]
    pub root: PathBuf,

    /// Length of the pending-connection queue
    #[arg(long, default_value_t = 128)]
    pub backlog: i32,

    /// Maximum number of readiness events handled per wait
    #[arg(long = "events", default_value_t = 1024)]
    pub event_capacity: usize,

    /// How long a wait may block before the shutdown flag is checked again
    #[arg(long = "wait-timeout-ms", default_value_t = 500)]
    pub wait_timeout_ms: u64,

    /// Bytes read from a socket per call
    #[arg(long, default_value_t = 1024)]
    pub chunk_size: usize,

    /// Requests longer than this are answered with 400
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_request_bytes: usize,

    /// How workers are run
    #[arg(long, value_enum, default_value_t = Strategy::Thread)]
    pub dispatch: Strategy,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(long)]
    pub foreground: bool,

    /// Write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log filter, e.g. `info` or `edgeserve=debug`
    #[arg(long = "log", default_value = "info", env = "RUST_LOG")]
    pub log_filter: String,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,
}

impl ServerConfig {
    /// A configuration with every default filled in, serving `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            root: root.into(),
            backlog: 128,
            event_capacity: 1024,
            wait_timeout_ms: 500,
            chunk_size: 1024,
            max_request_bytes: 64 * 1024,
            dispatch: Strategy::Thread,
            foreground: true,
            log_file: None,
            log_filter: "info".to_string(),
            help: None,
        }
    }

    /// `host:port`, as passed to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// The part of the configuration a worker is allowed to see.
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            root: self.root.clone(),
            chunk_size: self.chunk_size,
            max_request_bytes: self.max_request_bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "document root {} is not a directory",
                self.root.display()
            )));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be >= 1".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("events must be >= 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be >= 1".to_string()));
        }
        if self.max_request_bytes < self.chunk_size {
            return Err(Error::Config(
                "max request bytes must be at least one chunk".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates the configuration and turns every path into an absolute
    /// one, so it survives the daemon's change to `/`.
    ///
    /// The log filter is parsed and the log file opened once here, so that
    /// both are reported while stderr still reaches the operator.
    pub fn resolve(mut self) -> Result<Self> {
        self.validate()?;
        self.log_filter()?;

        self.root = fs::canonicalize(&self.root)?;
        if let Some(log_file) = self.log_file.take() {
            let log_file = absolute(&log_file)?;
            open_log(&log_file).map_err(|err| {
                Error::Config(format!(
                    "cannot open log file {}: {err}",
                    log_file.display()
                ))
            })?;
            self.log_file = Some(log_file);
        }
        Ok(self)
    }

    pub fn log_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.log_filter).map_err(|err| {
            Error::Config(format!("invalid log filter {:?}: {err}", self.log_filter))
        })
    }
}

/// Opens `path` for appending, creating it if needed.
pub fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
