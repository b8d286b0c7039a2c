use std::fs;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cmd::{open_lcm, parse_duration, SendArgs};
use crate::exit::{lcm_error, CliResult, SUCCESS, TIMEOUT};

/// How long to wait for queued messages before closing.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run(args: SendArgs, url: Option<&str>) -> CliResult<i32> {
    let interval = args.interval.as_deref().map(parse_duration).transpose()?;
    let payload = resolve_payload(&args)?;
    let lcm = open_lcm(url)?;

    for n in 0..args.count {
        if n > 0 {
            if let Some(interval) = interval {
                std::thread::sleep(interval);
            }
        }
        lcm.publish(&args.channel, &payload)
            .map_err(|err| lcm_error("publish failed", err))?;
    }

    let flushed = lcm
        .flush(FLUSH_TIMEOUT)
        .map_err(|err| lcm_error("flush failed", err))?;
    if let Some(stats) = lcm.stats() {
        debug!(
            sent = stats.messages_sent,
            discarded = stats.messages_discarded,
            "send finished"
        );
    }
    lcm.close();

    if flushed {
        Ok(SUCCESS)
    } else {
        warn!("queued messages were still pending at close");
        Ok(TIMEOUT)
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}
