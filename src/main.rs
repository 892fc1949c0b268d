use clap::{Parser, Subcommand};
use oblique::config::{ClientConfig, ServerConfig};
use oblique::error::Result;

/// Reverse TCP tunneling: expose an internal endpoint through a public server without
/// opening any inbound port on the internal side.
#[derive(Debug, Parser)]
#[command(name = "oblique", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the public-facing Server half of a tunnel.
    Server {
        /// Host to bind the control-channel listener on.
        #[arg(long, default_value = "0.0.0.0")]
        bind_host: String,
        /// Port to bind the control-channel listener on.
        #[arg(long, default_value_t = 8000)]
        bind_port: u16,
    },
    /// Run the internal Client half of a tunnel.
    Client {
        /// Server host to dial the control channel to.
        #[arg(long)]
        server_host: String,
        /// Server port to dial the control channel to.
        #[arg(long, default_value_t = 8000)]
        server_port: u16,
        /// Internal target host this forwarding relays to.
        #[arg(long)]
        target_host: String,
        /// Internal target port this forwarding relays to.
        #[arg(long)]
        target_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            bind_host,
            bind_port,
        } => {
            use std::net::ToSocketAddrs;
            let bind_addr = format!("{bind_host}:{bind_port}")
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .unwrap_or_else(|| ServerConfig::default().bind_addr);
            oblique::server::run(bind_addr, None).await
        }
        Commands::Client {
            server_host,
            server_port,
            target_host,
            target_port,
        } => {
            let config = ClientConfig {
                server_host,
                server_port,
                target_host,
                target_port,
                dial_delay: std::time::Duration::ZERO,
            };
            oblique::client::run(config).await
        }
    }
}
