use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lcmprims::LcmError;

use crate::cmd::{open_lcm, ListenArgs};
use crate::exit::{lcm_error, CliError, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

/// How often the loop checks for Ctrl-C and the message count.
pub(crate) const TICK: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, url: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    let lcm = open_lcm(url)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let printed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&printed);
    lcm.subscribe_fn(&args.pattern, move |message| {
        print_message(message, format);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .map_err(|err| lcm_error("subscribe failed", err))?;

    while running.load(Ordering::SeqCst) {
        if args
            .count
            .is_some_and(|count| printed.load(Ordering::SeqCst) >= count)
        {
            break;
        }
        match lcm.handle_timeout(TICK) {
            Ok(_) => {}
            Err(LcmError::Exhausted) => break,
            Err(err) => return Err(lcm_error("receive failed", err)),
        }
    }

    lcm.close();
    Ok(SUCCESS)
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
