use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lcmprims::log::{LogConfig, LogWriter, Recorder};
use lcmprims::LcmError;
use serde::Serialize;
use tracing::info;

use crate::cmd::listen::{install_ctrlc_handler, TICK};
use crate::cmd::{open_lcm, RecordArgs};
use crate::exit::{lcm_error, log_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_summary, OutputFormat};

#[derive(Debug, Serialize)]
struct RecordSummary {
    path: String,
    pattern: String,
    recorded: u64,
    next_event_number: u64,
    bytes: u64,
}

pub fn run(args: RecordArgs, url: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    let config = LogConfig {
        sync_on_append: args.sync,
    };
    let writer = if args.append {
        LogWriter::open_append_with_config(&args.output, config)
    } else {
        LogWriter::create_with_config(&args.output, config)
    }
    .map_err(|err| log_error("open log failed", err))?;
    let first_event = writer.next_event_number();
    let writer = Arc::new(Mutex::new(writer));

    let lcm = open_lcm(url)?;
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    lcm.subscribe(&args.pattern, Recorder::shared(Arc::clone(&writer)))
        .map_err(|err| lcm_error("subscribe failed", err))?;
    info!(path = %args.output.display(), pattern = %args.pattern, "recording");

    let recorded = || {
        writer
            .lock()
            .map(|w| w.next_event_number() - first_event)
            .unwrap_or(0)
    };

    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| recorded() >= count) {
            break;
        }
        match lcm.handle_timeout(TICK) {
            Ok(_) => {}
            Err(LcmError::Exhausted) => break,
            Err(err) => return Err(lcm_error("receive failed", err)),
        }
    }
    lcm.close();

    let mut writer = writer
        .lock()
        .map_err(|_| CliError::new(INTERNAL, "log writer lock poisoned"))?;
    writer
        .close()
        .map_err(|err| log_error("closing log failed", err))?;

    let summary = RecordSummary {
        path: args.output.display().to_string(),
        pattern: args.pattern,
        recorded: writer.next_event_number() - first_event,
        next_event_number: writer.next_event_number(),
        bytes: writer.len(),
    };
    print_summary("record", &summary, format);
    Ok(SUCCESS)
}
