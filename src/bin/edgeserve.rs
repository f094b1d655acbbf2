use std::{
    process,
    sync::{atomic::AtomicBool, Arc, Mutex},
};

use clap::Parser;
use edgeserve::{config::open_log, daemon, serve, ServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*};

// $ edgeserve -h 127.0.0.1 -p 3000 -d ./www --foreground
// $ curl localhost:3000/index.html
fn main() {
    let config = match ServerConfig::parse().resolve() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("edgeserve: {err}");
            process::exit(1);
        }
    };

    // Detach before anything spawns a thread or opens a descriptor we want
    // to keep.
    if !config.foreground {
        if let Err(err) = daemon::daemonize() {
            eprintln!("edgeserve: {err}");
            process::exit(1);
        }
    }

    // `resolve` already opened the log file once; failing now means it went
    // away in between, and nobody would see the logs.
    if let Err(err) = init_logging(&config) {
        eprintln!("edgeserve: {err}");
        process::exit(1);
    }

    // SIGINT / SIGTERM only raise a flag; the loop notices it after its
    // current wait returns.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!("failed to install handler for signal {signal}: {err}");
            process::exit(1);
        }
    }

    info!(pid = process::id(), "starting");
    if let Err(err) = serve(&config, &shutdown) {
        error!("{err}");
        process::exit(1);
    }
    info!("stopped");
}

fn init_logging(config: &ServerConfig) -> edgeserve::Result<()> {
    let filter = config.log_filter()?;

    let file = match &config.log_file {
        Some(path) => Some(open_log(path)?),
        None => None,
    };

    let (file_layer, stdout_layer) = match file {
        Some(file) => (
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false)),
            None,
        ),
        None => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    Ok(())
}
