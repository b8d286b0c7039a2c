use lcmprims::log::{LogEvent, LogReader};
use lcmprims::router::ChannelPattern;

use crate::cmd::DumpArgs;
use crate::exit::{log_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_event, OutputFormat};

pub fn run(args: DumpArgs, format: OutputFormat) -> CliResult<i32> {
    let filter = args
        .channel
        .as_deref()
        .map(ChannelPattern::new)
        .transpose()
        .map_err(|err| CliError::new(USAGE, format!("--channel: {err}")))?;

    let mut reader =
        LogReader::open(&args.log).map_err(|err| log_error("open log failed", err))?;
    if let Some(ts) = args.from {
        reader
            .seek_to_timestamp(ts)
            .map_err(|err| log_error("seek failed", err))?;
    }

    let mut printed = 0u64;
    for event in reader {
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
        let event = event.map_err(|err| log_error("read log failed", err))?;
        if !wanted(filter.as_ref(), &event) {
            continue;
        }
        print_event(&event, format);
        printed += 1;
    }

    Ok(SUCCESS)
}

fn wanted(filter: Option<&ChannelPattern>, event: &LogEvent) -> bool {
    filter.is_none_or(|pattern| pattern.matches(&event.channel))
}
