use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lcmprims::transport::{HubStats, TcpHub, TcpqConfig};
use serde::Serialize;
use tracing::info;

use crate::cmd::listen::{install_ctrlc_handler, TICK};
use crate::cmd::HubArgs;
use crate::exit::{transport_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_summary, OutputFormat};

/// Interval between traffic reports on stderr.
const REPORT_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct HubSummary {
    address: String,
    connections: u64,
    messages: u64,
    bytes: u64,
    dropped_clients: u64,
}

pub fn run(args: HubArgs, format: OutputFormat) -> CliResult<i32> {
    let bind: SocketAddr = args
        .bind
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("--bind: bad address {:?}", args.bind)))?;
    let hub = Arc::new(
        TcpHub::bind(bind, TcpqConfig::default())
            .map_err(|err| transport_error("hub bind failed", err))?,
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let runner = {
        let hub = Arc::clone(&hub);
        std::thread::Builder::new()
            .name("lcmprims-hub".to_string())
            .spawn(move || hub.run())
            .map_err(|err| CliError::new(INTERNAL, format!("hub thread failed: {err}")))?
    };

    let started = Instant::now();
    let mut last = (Instant::now(), HubStats::default());
    while running.load(Ordering::SeqCst) && !runner.is_finished() {
        std::thread::sleep(TICK);
        if last.0.elapsed() >= REPORT_EVERY {
            let stats = hub.stats();
            let secs = last.0.elapsed().as_secs_f64();
            info!(
                uptime_s = started.elapsed().as_secs(),
                clients = stats.clients,
                kb_per_s = (stats.bytes_relayed - last.1.bytes_relayed) as f64 / 1024.0 / secs,
                "hub traffic"
            );
            last = (Instant::now(), stats);
        }
    }

    hub.stop();
    runner
        .join()
        .map_err(|_| CliError::new(INTERNAL, "hub thread panicked"))?
        .map_err(|err| transport_error("hub failed", err))?;

    let stats = hub.stats();
    let summary = HubSummary {
        address: hub.local_addr().to_string(),
        connections: stats.connections_accepted,
        messages: stats.messages_relayed,
        bytes: stats.bytes_relayed,
        dropped_clients: stats.slow_clients_dropped,
    };
    print_summary("hub", &summary, format);
    Ok(SUCCESS)
}
