//! RPC node binary.
//!
//! `serve` hosts the echo service over TCP; `call` connects to a node and
//! exercises unary calls, one-way messages and both streaming directions.

use clap::{Parser, Subcommand};
use rpc_session::{listen_tcp, Acceptor, Channel, CredentialsConfig};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod echo;

use config::NodeConfig;
use logging::RpcLogFormatter;

/// RPC node: echo server and client driver
#[derive(Parser, Debug)]
#[command(name = "rpc-node", version, about = "RPC wire engine node")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Keepalive ping interval, e.g. 10s
    #[arg(long, global = true)]
    ping_interval: Option<humantime::Duration>,

    /// Fault a channel after this much inbound silence, e.g. 30s
    #[arg(long, global = true)]
    idle_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the echo service
    Serve {
        /// Listen address, e.g. 0.0.0.0:9400
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Connect to a node and exercise it
    Call {
        /// Server address, e.g. 127.0.0.1:9400
        #[arg(long)]
        connect: Option<SocketAddr>,

        /// Text to echo; its words feed the duplex stream
        #[arg(long, default_value = "hello from rpc-node")]
        text: String,

        /// Items requested from the counter stream
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// Login user
        #[arg(long)]
        user: Option<String>,

        /// Login password
        #[arg(long, requires = "user")]
        password: Option<String>,
    },
}

fn millis(duration: humantime::Duration) -> u64 {
    Duration::from(duration).as_millis() as u64
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive(format!("rpc_node={}", args.log_level).parse()?)
            .add_directive(format!("rpc_session={}", args.log_level).parse()?)
            .add_directive(format!("rpc_wire={}", args.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(RpcLogFormatter::new("rpc"))
        .init();

    info!("Starting rpc-node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    if let Some(interval) = args.ping_interval {
        config.channel.ping_interval_ms = Some(millis(interval));
    }
    if let Some(timeout) = args.idle_timeout {
        config.channel.idle_timeout_ms = Some(millis(timeout));
    }

    match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Call {
            connect,
            text,
            count,
            user,
            password,
        } => {
            if let Some(user) = user {
                config.channel.credentials = Some(CredentialsConfig {
                    user,
                    password: password.unwrap_or_default(),
                });
            }
            call(config, connect, &text, count).await
        }
    }
}

async fn serve(config: NodeConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let addr = listen.unwrap_or(config.listen);
    let mut acceptor = Acceptor::new(config.channel.clone(), Arc::new(echo::EchoService))?;
    if let Some(authenticator) = config.authenticator() {
        component_info!("server", "Authentication enabled for {} user(s)", config.users.len());
        acceptor = acceptor.with_authenticator(Arc::new(authenticator));
    }

    let listener = listen_tcp(addr).await?;
    component_info!("server", "Echo service '{}' listening on {}", config.channel.service_name, addr);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
        }
        signal.cancel();
    });

    Arc::new(acceptor).serve(listener, shutdown).await?;
    info!("rpc-node shutdown complete");
    Ok(())
}

async fn call(config: NodeConfig, connect: Option<SocketAddr>, text: &str, count: u32) -> anyhow::Result<()> {
    let addr = connect.unwrap_or(config.connect);
    let channel = Channel::tcp(config.channel, addr)?;

    if let Err(e) = channel.try_connect().await {
        component_error!("client", "Cannot connect to {}: {}", addr, e);
        return Err(e.into());
    }

    let result = echo::exercise(&channel, text, count).await;
    let stats = channel.stats();
    channel.close_async().await;

    let report = result?;
    println!("echo:    {}", report.echoed);
    println!("counter: {:?}", report.counted);
    println!("duplex:  {:?} ({} echoed)", report.duplex_items, report.duplex_result);
    println!(
        "traffic: {} bytes out, {} bytes in, {} messages out, {} in, took {:?}",
        stats.bytes_out, stats.bytes_in, stats.messages_out, stats.messages_in, report.elapsed
    );
    if let Some(rtt) = stats.last_rtt {
        println!("rtt:     {:?}", rtt);
    }
    Ok(())
}
