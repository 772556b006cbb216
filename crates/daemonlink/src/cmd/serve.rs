use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daemonlink_transport::{AcceptPolicy, Connection, IpcClient, IpcServer, ServerConfig};
use tracing::{debug, info, warn};

use crate::cmd::{parse_timeout, ServeArgs};
use crate::exit::{ipc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_bound, print_session, OutputFormat};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let (policy, limit) = if args.once {
        (AcceptPolicy::Single, Some(1))
    } else {
        (AcceptPolicy::Reusable, args.count)
    };
    let config = ServerConfig::default()
        .with_timeout(timeout)
        .with_accept_policy(policy);

    let mut server = IpcServer::bind_with_config(&args.name, config)
        .map_err(|err| ipc_error("bind failed", err))?;
    print_bound(&args.name, server.connection_name(), format);

    let stopping = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(stopping.clone(), server.connection_name().to_path_buf())?;

    let outcome = serve_loop(&mut server, args.reply.as_deref(), limit, &stopping, format);
    let cleanup = server
        .cleanup()
        .map_err(|err| ipc_error("cleanup failed", err));
    info!(sessions = server.sessions_accepted(), "server stopped");

    settle(outcome, cleanup)
}

/// Combine the serve result with the cleanup result. A serve failure wins;
/// a cleanup failure behind it is logged rather than lost.
fn settle(outcome: CliResult<i32>, cleanup: CliResult<()>) -> CliResult<i32> {
    match (outcome, cleanup) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => {
            warn!(error = %cleanup_err, "cleanup failed after serve error");
            Err(err)
        }
    }
}

fn serve_loop(
    server: &mut IpcServer,
    fixed_reply: Option<&str>,
    limit: Option<u64>,
    stopping: &AtomicBool,
    format: OutputFormat,
) -> CliResult<i32> {
    let mut served = 0u64;
    while !stopping.load(Ordering::SeqCst) && limit.is_none_or(|max| served < max) {
        let mut session = server
            .accept()
            .map_err(|err| ipc_error("accept failed", err))?;
        if stopping.load(Ordering::SeqCst) {
            debug!("woken for shutdown");
            break;
        }
        served += 1;

        match answer(&mut session, fixed_reply) {
            Ok((request, reply_size)) => print_session(served, &request, reply_size, format),
            Err(err) => warn!(session = served, error = %err, "session failed"),
        }
        if let Err(err) = session.finish() {
            warn!(session = served, error = %err, "session teardown failed");
        }
    }
    Ok(SUCCESS)
}

/// Read one full request and answer it. Returns the request and the reply size.
fn answer(
    conn: &mut Connection,
    fixed_reply: Option<&str>,
) -> daemonlink_transport::Result<(Vec<u8>, usize)> {
    let request = conn.read()?;
    let reply = reply_for(&request, fixed_reply);
    conn.write(&reply)?;
    info!(request_size = request.len(), reply_size = reply.len(), "answered request");
    Ok((request.to_vec(), reply.len()))
}

fn reply_for(request: &[u8], fixed_reply: Option<&str>) -> Vec<u8> {
    match fixed_reply {
        Some(text) => text.as_bytes().to_vec(),
        None => request.to_vec(),
    }
}

fn install_ctrlc_handler(stopping: Arc<AtomicBool>, endpoint: PathBuf) -> CliResult<()> {
    ctrlc::set_handler(move || {
        stopping.store(true, Ordering::SeqCst);
        // A blocked accept only returns once a client arrives; connect to ourselves.
        if let Err(err) = IpcClient::connect(&endpoint, Some(WAKE_TIMEOUT)) {
            debug!(error = %err, "shutdown wake-up connect failed");
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
