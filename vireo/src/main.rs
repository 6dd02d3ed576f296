use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use vireo_core::ServerState;
use vireo_server::{Reactor, TCPListener};

mod config;

/// Single-threaded IRC server.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, default_value = "vireo.yml")]
    config: PathBuf,

    /// Overrides the port of the configuration file.
    port: Option<u16>,

    /// Overrides the connection password of the configuration file.
    password: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = config::Config::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = args.password {
        config.password = Some(password);
    }

    let server_config = config.server_config()?;
    let server_state = ServerState::new(server_config).context("invalid configuration")?;
    log::info!("starting {}", server_state.server_name());
    let listener = TCPListener::try_new(&config.address, config.port)?;
    let mut reactor = Reactor::new(listener, server_state)?;

    if let Err(err) = reactor.run() {
        log::error!("{err:#}");
        reactor.shutdown();
        return Err(err);
    }
    Ok(())
}
