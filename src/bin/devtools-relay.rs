//! Privileged relay from a TCP port to a web view's devtools socket.
//!
//! Prints the bound port as the first stdout line; logs go to stderr.
//!
//! ```text
//! devtools-relay webview_devtools_remote_1234
//! devtools-relay --pid 1234 --port 9222
//! devtools-relay --path /tmp/devtools.sock
//! ```

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use devtools_bridge::relay::{Relay, RelayTarget};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Abstract socket name, e.g. webview_devtools_remote_1234.
    #[arg(required_unless_present_any = ["pid", "path"])]
    socket: Option<String>,

    /// Relay to the devtools socket of this process id.
    #[arg(long, conflicts_with_all = ["socket", "path"])]
    pid: Option<u32>,

    /// Relay to a filesystem socket instead of an abstract name.
    #[arg(long, conflicts_with = "socket")]
    path: Option<PathBuf>,

    /// TCP port to listen on (0 = ephemeral).
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn target(&self) -> Option<RelayTarget> {
        if let Some(pid) = self.pid {
            return Some(RelayTarget::devtools(pid));
        }
        if let Some(path) = &self.path {
            return Some(RelayTarget::Path(path.clone()));
        }
        self.socket.clone().map(RelayTarget::Abstract)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "devtools_bridge=debug,devtools_relay=debug"
    } else {
        "devtools_bridge=info,devtools_relay=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let Some(target) = cli.target() else {
        error!("No relay target given");
        return ExitCode::FAILURE;
    };

    let relay = match Relay::bind((cli.bind, cli.port)).await {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "Failed to bind relay");
            return ExitCode::FAILURE;
        }
    };

    let port = match relay.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!(error = %e, "Relay has no local address");
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if writeln!(stdout, "{port}").and_then(|()| stdout.flush()).is_err() {
        return ExitCode::FAILURE;
    }
    drop(stdout);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.cancel();
    });

    match relay.run_until(target, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Relay failed");
            ExitCode::FAILURE
        }
    }
}
