use std::io::{IsTerminal, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct BoundOutput<'a> {
    event: &'static str,
    name: &'a str,
    connection_name: String,
    pid: u32,
}

/// Announce the endpoint a server is listening on.
///
/// `raw` and `pretty` print the bare connection name so scripts can read it
/// with a single line read.
pub fn print_bound(name: &str, connection_name: &Path, format: OutputFormat) {
    let connection_name = connection_name.display().to_string();
    match format {
        OutputFormat::Json => {
            let out = BoundOutput {
                event: "bound",
                name,
                connection_name,
                pid: std::process::id(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "CONNECTION NAME", "PID"])
                .add_row(vec![
                    name.to_string(),
                    connection_name,
                    std::process::id().to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => println!("{connection_name}"),
    }
}

#[derive(Serialize)]
struct SessionOutput<'a> {
    event: &'static str,
    session: u64,
    request_size: usize,
    reply_size: usize,
    request: &'a str,
    timestamp: String,
}

pub fn print_session(session: u64, request: &[u8], reply_size: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let preview = payload_preview(request);
            let out = SessionOutput {
                event: "session",
                session,
                request_size: request.len(),
                reply_size,
                request: &preview,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "session={session} request_size={} reply_size={reply_size} request={}",
                request.len(),
                payload_preview(request)
            );
        }
        OutputFormat::Raw => {}
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    endpoint: String,
    request_size: usize,
    reply_size: usize,
    reply: &'a str,
    elapsed_ms: u128,
    timestamp: String,
}

pub fn print_reply(
    endpoint: &Path,
    request_size: usize,
    reply: &[u8],
    elapsed: Duration,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let preview = payload_preview(reply);
            let out = ReplyOutput {
                endpoint: endpoint.display().to_string(),
                request_size,
                reply_size: reply.len(),
                reply: &preview,
                elapsed_ms: elapsed.as_millis(),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SENT", "RECEIVED", "ELAPSED", "REPLY"])
                .add_row(vec![
                    request_size.to_string(),
                    reply.len().to_string(),
                    format!("{}ms", elapsed.as_millis()),
                    payload_preview(reply),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "sent={request_size} received={} elapsed={}ms reply={}",
                reply.len(),
                elapsed.as_millis(),
                payload_preview(reply)
            );
        }
        OutputFormat::Raw => print_raw(reply),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_passes_text_through() {
        assert_eq!(payload_preview(b"pong"), "pong");
        assert_eq!(payload_preview(b""), "");
    }

    #[test]
    fn preview_summarizes_binary() {
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
