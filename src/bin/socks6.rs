use anyhow::{Result, bail};
use clap::Parser;
use socks6::{Filtering, ServerConfig, Socks6Server, auth::UserPass};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS6 proxy server", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS6 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS6 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Reject requests that do not arrive in a single packet
    #[arg(long)]
    single_packet: bool,

    /// Length of issued session ids in bytes
    #[arg(long, default_value_t = 8)]
    session_id_length: usize,

    /// Seconds a client may take to send its request and authenticate
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// Only relay datagrams from hosts the client has sent to
    #[arg(long)]
    address_dependent_filtering: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let config = ServerConfig {
        session_id_len: args.session_id_length,
        single_packet: args.single_packet,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        filtering: if args.address_dependent_filtering {
            Filtering::AddressDependent
        } else {
            Filtering::EndpointIndependent
        },
        ..ServerConfig::default()
    };

    // Instantiate server
    let mut server = Socks6Server::new(args.listen)
        .with_config(config)
        .with_auth(auth);

    // Stop on Ctrl-C
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // Run it
    info!("Starting SOCKS6 proxy: {}", server.listen_addr);
    server.run().await
}
