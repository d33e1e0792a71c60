use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use byte_unit::{Byte, UnitType};
use clap::Parser;
use pretty_duration::pretty_duration;
use tracing::{error, info, warn};

use common::config::config::ProxyConfig;
use common::err::PResult;
use common::log::log_event;
use common::log::tracing_factory::{OutputType, TracingFactory, TracingFactoryOptions};
use engine::dcb::stream::server_ssl_context;
use engine::worker::{Call, ControlMessage, ExecuteMode, Worker, WorkerHandle, WorkerShared};
use engine::MAX_EVENTS_DEFAULT;
use protocol::proxy_header::parse_networks_from_string;

#[derive(Parser, Debug, Clone)]
#[command(name = "proxy-cli")]
#[command(version = "0.1.0")]
#[command(about = "MariaDB protocol-aware routing proxy")]
#[command(long_about = None)]
pub(crate) struct CliArgs {
    #[arg(short, long, help = "Path to loaded configuration file", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "override the configured worker count", value_name = "N")]
    pub threads: Option<usize>,

    /// enable debug info
    #[arg(short, long, help = "enable debug mode", default_value_t = false)]
    pub debug: bool,

    #[arg(long, help = "log to files instead of stdout", default_value_t = false)]
    pub log_to_file: bool,
}

/// Shutdown signal targets. The signal handler may only take the
/// signal-safe path: an atomic flag plus an eventfd write per worker.
static WORKERS: OnceLock<Vec<Arc<WorkerShared>>> = OnceLock::new();

extern "C" fn handle_signal(_signum: libc::c_int) {
    if let Some(workers) = WORKERS.get() {
        for worker in workers {
            worker.post_message(ControlMessage::Shutdown);
        }
    }
}

fn main() -> PResult<()> {
    let args = CliArgs::parse();

    let output = if args.log_to_file {
        OutputType::Log
    } else {
        OutputType::Stdout
    };
    TracingFactory::init_log_with_options(TracingFactoryOptions::new_with_type(args.debug, output));

    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => {
            warn!("No configuration file given, using defaults.");
            ProxyConfig::default()
        }
    };
    if let Some(threads) = args.threads {
        config.threads = threads;
    }

    // Log-event overrides from the [events] table.
    for (name, value) in &config.events {
        if log_event::configure(name, value) == log_event::ConfigureResult::Invalid {
            error!("Invalid event configuration: {} = {}", name, value);
        }
    }

    // Validate the listener surface up front: allowed proxy-protocol
    // networks and TLS material. Broken values should stop the start,
    // not the first connection.
    for listener in &config.listener {
        let subnets = parse_networks_from_string(&listener.proxy_protocol_networks)?;
        if !subnets.is_empty() {
            info!(
                "Listener '{}' accepts proxy headers from {} network(s).",
                listener.name,
                subnets.len()
            );
        }

        if let (Some(cert), Some(key)) = (&listener.ssl_cert, &listener.ssl_key) {
            server_ssl_context(cert, key)?;
            info!("Listener '{}' offers TLS.", listener.name);
        }
    }

    let threads = config.effective_threads();
    info!(
        "Starting {} worker(s), write queue watermarks {} / {}.",
        threads,
        Byte::from_u64(config.writeq_high_water).get_appropriate_unit(UnitType::Binary),
        Byte::from_u64(config.writeq_low_water).get_appropriate_unit(UnitType::Binary),
    );

    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(threads);
    for id in 0..threads {
        handles.push(Worker::start(id, MAX_EVENTS_DEFAULT)?);
    }

    let shareds: Vec<Arc<WorkerShared>> =
        handles.iter().map(|h| Arc::clone(h.shared())).collect();
    let _ = WORKERS.set(shareds.clone());

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    // Periodic load report, driven by worker 0's timer.
    let started = Instant::now();
    handles[0].execute(
        ExecuteMode::Queued,
        Box::new(move |worker| {
            worker.delayed_call(10_000, move |_worker, call| {
                if call == Call::Cancel {
                    return false;
                }

                let loads: Vec<String> = shareds
                    .iter()
                    .map(|s| format!("{}: {}%", s.id(), s.load()))
                    .collect();
                info!(
                    "up {}, worker load [{}]",
                    pretty_duration(&started.elapsed(), None),
                    loads.join(", ")
                );
                true
            });
        }),
        None,
    );

    info!("Proxy is running; send SIGINT or SIGTERM to stop.");

    for handle in &mut handles {
        handle.join();
    }

    info!("All workers have shut down.");
    Ok(())
}
