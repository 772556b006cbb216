use daemonlink_transport::DEFAULT_READ_CHUNK;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("daemonlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let fields = build_info();
    match format {
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), serde_json::Value::String(value)))
                .collect();
            println!(
                "{}",
                serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
            );
        }
        _ => {
            for (key, value) in fields {
                println!("{key}: {value}");
            }
        }
    }
    Ok(SUCCESS)
}

fn build_info() -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("name", "daemonlink".to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
        (
            "build_target",
            option_env!("DAEMONLINK_BUILD_TARGET")
                .unwrap_or("unknown")
                .to_string(),
        ),
        (
            "git_hash",
            option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        ),
        ("read_chunk", DEFAULT_READ_CHUNK.to_string()),
    ];
    fields.extend(transport_info());
    fields
}

#[cfg(unix)]
fn transport_info() -> Vec<(&'static str, String)> {
    use daemonlink_transport::uds::{SOCKET_DIR_PREFIX, SOCKET_MODE};

    vec![
        ("transport", "unix-socket".to_string()),
        (
            "endpoint",
            format!(
                "{}/{SOCKET_DIR_PREFIX}XXXXXX/{{name}}.sock",
                std::env::temp_dir().display()
            ),
        ),
        ("socket_mode", format!("{SOCKET_MODE:o}")),
    ]
}

#[cfg(windows)]
fn transport_info() -> Vec<(&'static str, String)> {
    use daemonlink_transport::endpoint::{PIPE_NAMESPACE, SUFFIX_BYTES};
    use daemonlink_transport::pipe::BUFFER_SIZE;

    vec![
        ("transport", "named-pipe".to_string()),
        ("endpoint", format!("{PIPE_NAMESPACE}{{name}}-{{suffix}}.pipe")),
        ("suffix_bytes", SUFFIX_BYTES.to_string()),
        ("pipe_buffer", BUFFER_SIZE.to_string()),
    ]
}
