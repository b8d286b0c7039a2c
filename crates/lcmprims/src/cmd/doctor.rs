use std::path::Path;

use lcmprims::log::{LogReader, LogWriter};
use lcmprims::transport::{TcpqClient, Transport, TransportConfig};
use lcmprims::{ProviderUrl, DEFAULT_URL_ENV};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, url: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    let (url_check, parsed) = provider_url_check(url);
    let mut checks = vec![url_check];
    checks.push(multicast_bind_check(parsed.as_ref()));
    checks.push(hub_connect_check(parsed.as_ref()));
    checks.push(log_roundtrip_check());
    checks.push(compiled_features_check());

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let overall = if has_fail { "fail" } else { "pass" };
    let output = DoctorOutput { checks, overall };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("lcmprims doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn provider_url_check(url: Option<&str>) -> (CheckResult, Option<ProviderUrl>) {
    let (source, parsed) = match url {
        Some(url) => ("--url", ProviderUrl::parse(url)),
        None => (DEFAULT_URL_ENV, ProviderUrl::from_env()),
    };
    match parsed {
        Ok(parsed) => (
            CheckResult::new(
                "provider_url",
                CheckStatus::Pass,
                format!("{source} selects {}", parsed.provider_name()),
            ),
            Some(parsed),
        ),
        Err(err) => (
            CheckResult::new("provider_url", CheckStatus::Fail, err.to_string()),
            None,
        ),
    }
}

fn multicast_bind_check(url: Option<&ProviderUrl>) -> CheckResult {
    let config = match url {
        Some(ProviderUrl::Udpm(config)) => config.clone(),
        Some(other @ (ProviderUrl::File { .. } | ProviderUrl::Tcpq { .. })) => {
            return CheckResult::new(
                "multicast_bind",
                CheckStatus::Skip,
                format!("{} provider selected", other.provider_name()),
            )
        }
        None => TransportConfig::default(),
    };

    let group = config.group_addr();
    match Transport::bind(config) {
        Ok(transport) => {
            transport.close();
            CheckResult::new(
                "multicast_bind",
                CheckStatus::Pass,
                format!("joined {group}"),
            )
        }
        Err(err) => CheckResult::new(
            "multicast_bind",
            CheckStatus::Fail,
            format!("{group}: {err}"),
        ),
    }
}

fn hub_connect_check(url: Option<&ProviderUrl>) -> CheckResult {
    let Some(ProviderUrl::Tcpq { addr, config }) = url else {
        return CheckResult::new("hub_connect", CheckStatus::Skip, "no tcpq provider selected");
    };
    match TcpqClient::connect(addr.as_str(), config) {
        Ok(client) => {
            client.close();
            CheckResult::new("hub_connect", CheckStatus::Pass, format!("connected to {addr}"))
        }
        Err(err) => CheckResult::new("hub_connect", CheckStatus::Fail, err.to_string()),
    }
}

fn log_roundtrip_check() -> CheckResult {
    let path = std::env::temp_dir().join(format!(
        "lcmprims-doctor-{}-{}.lcmlog",
        std::process::id(),
        lcmprims::router::now_utime()
    ));
    let result = write_and_read_back(&path);
    let _ = std::fs::remove_file(&path);

    match result {
        Ok(()) => CheckResult::new(
            "log_roundtrip",
            CheckStatus::Pass,
            format!("wrote and read back a log in {}", std::env::temp_dir().display()),
        ),
        Err(err) => CheckResult::new("log_roundtrip", CheckStatus::Fail, err.to_string()),
    }
}

fn write_and_read_back(path: &Path) -> lcmprims::log::Result<()> {
    let mut writer = LogWriter::create(path)?;
    writer.append("LCMPRIMS_DOCTOR", b"ping", 1)?;
    writer.close()?;

    let mut reader = LogReader::open(path)?;
    match reader.read_next()? {
        Some(event) if event.channel == "LCMPRIMS_DOCTOR" && event.payload.as_ref() == b"ping" => {
            Ok(())
        }
        _ => Err(lcmprims::log::LogError::Corrupt {
            offset: lcmprims::log::HEADER_LEN,
            reason: "record did not read back".to_string(),
        }),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "async") {
        features.push("async");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
