//! `smol-tftpd`: serve a directory over TFTP.
//!
//! Settings come from an optional TOML file, then command line overrides.
//! Set `RUST_LOG` to control verbosity (default `info`).

use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use smol_tftpd::{
    config::Config, device::UdpSocketDevice, error::Result, server::Server, socket,
};
use smoltcp::time::Instant;
use tracing_subscriber::EnvFilter;

/// A single-threaded TFTP server.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML file to read settings from.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Local address to listen on.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Listening port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,
    /// Directory to serve, overriding the config file.
    #[arg(short, long)]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(root) = cli.root {
        config.root = root;
    }

    let mut device = UdpSocketDevice::new(cli.bind);
    let host = device.host();
    let mut iface = socket::interface(&mut device, host, Instant::now());
    let mut server = Server::new(config, &mut device, Vec::new())?;
    server.run(&mut iface, &mut device)
}
