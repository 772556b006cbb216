use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bind an endpoint and answer requests, one client at a time.
    Serve(ServeArgs),
    /// Send one request and print the reply.
    Send(SendArgs),
    /// Run a local round trip and cleanup self-test.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Logical endpoint name; the printed connection name is derived from it.
    #[arg(env = "DAEMONLINK_NAME", default_value = "daemonlink")]
    pub name: String,
    /// Bound on each accept, read and write (e.g. 30s, 1.5s, 500ms, none).
    #[arg(long, env = "DAEMONLINK_TIMEOUT", default_value = "none")]
    pub timeout: String,
    /// Fixed reply for every request. Default: echo the request.
    #[arg(long)]
    pub reply: Option<String>,
    /// Exit after serving N sessions.
    #[arg(long, conflicts_with = "once")]
    pub count: Option<u64>,
    /// Serve a single session, then exit.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Connection name printed by `serve`.
    pub endpoint: PathBuf,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Bound on connecting and on each read and write (e.g. 5s, 1.5s, 500ms, none).
    #[arg(long, env = "DAEMONLINK_TIMEOUT", default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse a timeout flag. `none` (or `forever`) disables the bound.
pub fn parse_timeout(input: &str) -> CliResult<Option<Duration>> {
    match input.trim() {
        "none" | "forever" => Ok(None),
        other => parse_duration(other).map(Some),
    }
}

/// Parse `500ms`, `2s`, `1.5s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, scale) = if let Some(num) = input.strip_suffix("ms") {
        (num, 1e-3)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, 1.0)
    } else {
        (input, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Duration::try_from_secs_f64(value * scale)
        .map_err(|err| CliError::new(USAGE, format!("invalid duration {input}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("infs").is_err());
    }

    #[test]
    fn parse_timeout_accepts_none() {
        assert_eq!(parse_timeout("none").unwrap(), None);
        assert_eq!(
            parse_timeout("500ms").unwrap(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(parse_timeout("bad").unwrap_err().code, USAGE);
    }
}
