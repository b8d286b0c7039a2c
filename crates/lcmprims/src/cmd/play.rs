use std::sync::atomic::Ordering;
use std::time::Duration;

use lcmprims::log::{LogReader, PlaybackMode, Player};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{open_lcm, PlayArgs};
use crate::exit::{lcm_error, log_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_summary, OutputFormat};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct PlaySummary {
    path: String,
    published: u64,
    bytes: u64,
    cancelled: bool,
    flushed: bool,
}

pub fn run(args: PlayArgs, url: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    let mode = playback_mode(args.speed);
    let reader = LogReader::open(&args.log).map_err(|err| log_error("open log failed", err))?;
    let mut player = Player::new(reader, mode).map_err(|err| log_error("bad playback", err))?;
    if let Some(ts) = args.from {
        player = player.start_at(ts);
    }

    let cancel = player.cancel_handle();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })?;

    let lcm = open_lcm(url)?;
    info!(path = %args.log.display(), ?mode, "replaying log");

    let mut published = 0u64;
    let mut bytes = 0u64;
    while let Some(event) = player
        .next_paced()
        .map_err(|err| log_error("read log failed", err))?
    {
        lcm.publish(&event.channel, &event.payload)
            .map_err(|err| lcm_error("publish failed", err))?;
        published += 1;
        bytes += event.payload.len() as u64;
    }

    let flushed = lcm
        .flush(FLUSH_TIMEOUT)
        .map_err(|err| lcm_error("flush failed", err))?;
    if !flushed {
        warn!("queued messages were still pending at close");
    }
    lcm.close();

    let summary = PlaySummary {
        path: args.log.display().to_string(),
        published,
        bytes,
        cancelled: player.is_cancelled(),
        flushed,
    };
    print_summary("play", &summary, format);
    Ok(SUCCESS)
}

fn playback_mode(speed: f64) -> PlaybackMode {
    if speed == 0.0 {
        PlaybackMode::AsFastAsPossible
    } else {
        PlaybackMode::Timed { speed }
    }
}
