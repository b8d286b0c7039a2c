use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use lcmprims::Lcm;

use crate::exit::{lcm_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod dump;
pub mod hub;
pub mod listen;
pub mod play;
pub mod record;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish a message on a channel.
    Send(SendArgs),
    /// Print messages on channels matching a pattern.
    Listen(ListenArgs),
    /// Capture traffic to an event log.
    Record(RecordArgs),
    /// Republish an event log onto the network.
    Play(PlayArgs),
    /// Print the events in a log file.
    Dump(DumpArgs),
    /// Relay messages between tcpq:// clients.
    Hub(HubArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
}

pub fn run(command: Command, url: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, url),
        Command::Listen(args) => listen::run(args, url, format),
        Command::Record(args) => record::run(args, url, format),
        Command::Play(args) => play::run(args, url, format),
        Command::Dump(args) => dump::run(args, format),
        Command::Hub(args) => hub::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, url, format),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Channel to publish on.
    pub channel: String,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Number of times to publish the payload.
    #[arg(long, default_value_t = 1)]
    pub count: u64,
    /// Pause between publishes (e.g. 1s, 250ms).
    #[arg(long)]
    pub interval: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Channel pattern to subscribe to.
    #[arg(default_value = "*")]
    pub pattern: String,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Log file to write.
    pub output: PathBuf,
    /// Channel pattern to capture.
    #[arg(long, default_value = "*")]
    pub pattern: String,
    /// Stop after capturing N messages.
    #[arg(long)]
    pub count: Option<u64>,
    /// Append to an existing log instead of replacing it.
    #[arg(long)]
    pub append: bool,
    /// Fsync after every record.
    #[arg(long)]
    pub sync: bool,
}

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Log file to replay.
    pub log: PathBuf,
    /// Playback speed multiplier. 0 replays as fast as possible.
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,
    /// Start at the first event at or after this timestamp (µs).
    #[arg(long)]
    pub from: Option<i64>,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Log file to read.
    pub log: PathBuf,
    /// Start at the first event at or after this timestamp (µs).
    #[arg(long)]
    pub from: Option<i64>,
    /// Only print events on channels matching this pattern.
    #[arg(long)]
    pub channel: Option<String>,
    /// Stop after printing N events.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug)]
pub struct HubArgs {
    /// Address to accept clients on.
    #[arg(long, default_value = "127.0.0.1:7700")]
    pub bind: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

/// Open a context for `--url`, or `LCM_DEFAULT_URL` when none was given.
pub fn open_lcm(url: Option<&str>) -> CliResult<Lcm> {
    let lcm = match url {
        Some(url) => Lcm::new(url),
        None => Lcm::from_env(),
    };
    lcm.map_err(|err| lcm_error("open failed", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
