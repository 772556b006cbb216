use std::thread;
use std::time::{Duration, Instant};

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use daemonlink_transport::{ErrorKind, IpcClient, IpcError, IpcServer};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
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

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_transport_check(),
        round_trip_check(),
        accept_timeout_check(),
        cleanup_check(),
        temp_dir_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let output = DoctorOutput {
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };
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
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHECK", "STATUS", "DETAIL"]);
            for c in &output.checks {
                table.add_row(vec![
                    c.name.clone(),
                    status_text(c.status).to_string(),
                    c.detail.clone(),
                ]);
            }
            println!("{table}");
            println!("overall: {}", output.overall);
        }
        OutputFormat::Pretty => {
            println!("daemonlink doctor\n");
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
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
    }
}

fn platform_transport_check() -> CheckResult {
    let detail = if cfg!(windows) {
        "named pipes with overlapped I/O"
    } else {
        "Unix domain stream sockets"
    };
    CheckResult::new("platform_transport", CheckStatus::Info, detail)
}

fn round_trip_check() -> CheckResult {
    const NAME: &str = "round_trip";
    match ping_pong() {
        Ok(elapsed) => CheckResult::new(
            NAME,
            CheckStatus::Pass,
            format!("ping/pong in {}ms", elapsed.as_millis()),
        ),
        Err(detail) => CheckResult::new(NAME, CheckStatus::Fail, detail),
    }
}

fn ping_pong() -> Result<Duration, String> {
    let started = Instant::now();
    let mut server = IpcServer::bind("doctor", Some(CHECK_TIMEOUT))
        .map_err(|err| format!("bind failed: {err}"))?;
    let endpoint = server.connection_name().to_path_buf();

    let client = thread::spawn(move || -> Result<Vec<u8>, IpcError> {
        let mut client = IpcClient::connect(&endpoint, Some(CHECK_TIMEOUT))?;
        let reply = client.request(b"ping")?;
        client.close()?;
        Ok(reply.to_vec())
    });

    let served = server.serve_one(|conn| -> Result<Vec<u8>, IpcError> {
        let request = conn.read()?;
        conn.write(b"pong")?;
        Ok(request.to_vec())
    });
    let cleanup = server.cleanup();

    let request = served.map_err(|err| format!("server side failed: {err}"))?;
    let reply = client
        .join()
        .map_err(|_| "client thread panicked".to_string())?
        .map_err(|err| format!("client side failed: {err}"))?;
    cleanup.map_err(|err| format!("cleanup failed: {err}"))?;

    if request != b"ping" || reply != b"pong" {
        return Err(format!(
            "payload mismatch: server got {} bytes, client got {} bytes",
            request.len(),
            reply.len()
        ));
    }
    Ok(started.elapsed())
}

fn accept_timeout_check() -> CheckResult {
    const NAME: &str = "accept_timeout";
    let mut server = match IpcServer::bind("doctor-timeout", Some(PROBE_TIMEOUT)) {
        Ok(server) => server,
        Err(err) => return CheckResult::new(NAME, CheckStatus::Fail, format!("bind failed: {err}")),
    };

    let started = Instant::now();
    let result = match server.accept() {
        Ok(_) => CheckResult::new(NAME, CheckStatus::Fail, "unexpected client connected"),
        Err(err) if err.is_timeout() => CheckResult::new(
            NAME,
            CheckStatus::Pass,
            format!(
                "idle accept gave up after {}ms",
                started.elapsed().as_millis()
            ),
        ),
        Err(err) => CheckResult::new(NAME, CheckStatus::Fail, format!("accept failed: {err}")),
    };
    if let Err(err) = server.cleanup() {
        return CheckResult::new(NAME, CheckStatus::Fail, format!("cleanup failed: {err}"));
    }
    result
}

fn cleanup_check() -> CheckResult {
    const NAME: &str = "cleanup";
    let mut server = match IpcServer::bind("doctor-cleanup", None) {
        Ok(server) => server,
        Err(err) => return CheckResult::new(NAME, CheckStatus::Fail, format!("bind failed: {err}")),
    };
    let endpoint = server.connection_name().to_path_buf();

    if let Err(err) = server.cleanup().and_then(|()| server.cleanup()) {
        return CheckResult::new(NAME, CheckStatus::Fail, format!("cleanup failed: {err}"));
    }

    #[cfg(unix)]
    {
        let leftover = [Some(endpoint.as_path()), endpoint.parent()]
            .into_iter()
            .flatten()
            .find(|path| path.exists());
        if let Some(path) = leftover {
            return CheckResult::new(
                NAME,
                CheckStatus::Fail,
                format!("{} still exists", path.display()),
            );
        }
    }

    match IpcClient::connect(&endpoint, Some(PROBE_TIMEOUT)) {
        Ok(_) => CheckResult::new(NAME, CheckStatus::Fail, "endpoint still accepts clients"),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Timeout) => {
            CheckResult::new(NAME, CheckStatus::Pass, "endpoint removed, second cleanup was a no-op")
        }
        Err(err) => CheckResult::new(
            NAME,
            CheckStatus::Fail,
            format!("unexpected connect error after cleanup: {err}"),
        ),
    }
}

fn temp_dir_check() -> CheckResult {
    let dir = std::env::temp_dir();
    let status = if dir.is_dir() {
        CheckStatus::Info
    } else {
        CheckStatus::Fail
    };
    CheckResult::new("temp_dir", status, dir.display().to_string())
}
