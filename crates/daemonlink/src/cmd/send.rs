use std::fs;
use std::time::Instant;

use daemonlink_transport::IpcClient;
use tracing::debug;

use crate::cmd::{parse_timeout, SendArgs};
use crate::exit::{io_error, ipc_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let payload = resolve_payload(&args)?;

    let started = Instant::now();
    let mut client = IpcClient::connect(&args.endpoint, timeout)
        .map_err(|err| ipc_error("connect failed", err))?;
    client
        .write(&payload)
        .map_err(|err| ipc_error("send failed", err))?;
    let reply = client
        .read()
        .map_err(|err| ipc_error("receive failed", err))?;
    client
        .close()
        .map_err(|err| ipc_error("close failed", err))?;
    let elapsed = started.elapsed();
    debug!(sent = payload.len(), received = reply.len(), ?elapsed, "request complete");

    print_reply(&args.endpoint, payload.len(), &reply, elapsed, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json).map_err(|err| {
            CliError::new(DATA_INVALID, format!("--json is not valid JSON: {err}"))
        })?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
