//! bifrost — bifrost CLI client
//!
//! Control and test interface for bifrostd.

use std::io::{self, IsTerminal, Read, Write};

use bifrost::MethodKey;
use bifrost::client::BridgeClient;
use clap::{Parser, Subcommand};

/// Bifrost CLI client
#[derive(Parser)]
#[command(name = "bifrost")]
#[command(version = bifrost::PKG_VERSION)]
#[command(about = "Bifrost gRPC bridge client")]
struct Args {
    /// Server address
    #[arg(
        short,
        long,
        env = "BIFROST_ADDRESS",
        default_value = "http://127.0.0.1:9001"
    )]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain in-flight calls and stop the bridge
    Stop,

    /// Show bridge state and version
    Status,

    /// Call a method with an encoded request message
    Call {
        /// Method as `package.Service/Method`
        method: String,
        /// Request payload (or omit to read from stdin)
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let client = BridgeClient::connect(&args.address).await?;

    match args.command {
        Command::Stop => {
            if client.stop().await? {
                println!("stopping");
            } else {
                println!("not serving");
            }
        }
        Command::Status => {
            let status = client.status().await?;
            println!("state:   {}", status.state);
            println!("version: {}", status.version);
        }
        Command::Call { method, payload } => {
            let Some((service, name)) = method.trim_start_matches('/').split_once('/') else {
                return Err(
                    format!("method must look like package.Service/Method, got {method:?}").into(),
                );
            };
            let key = MethodKey::new(service, name);
            let payload = match payload {
                Some(payload) => payload.into_bytes(),
                None => read_stdin()?,
            };
            let reply = client.call(&key, payload).await?;
            io::stdout().write_all(&reply)?;
        }
    }

    Ok(())
}

fn read_stdin() -> io::Result<Vec<u8>> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        eprintln!("reading request payload from stdin (Ctrl-D to finish)");
    }
    let mut buf = Vec::new();
    stdin.read_to_end(&mut buf)?;
    Ok(buf)
}
