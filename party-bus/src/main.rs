use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::warn;

use party_bus::{
    broker,
    cli::{Cli, Command},
    client,
};

fn init_tracing(log_level: u8) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match log_level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.log_level());

    match cli.command {
        Command::Create(args) => {
            let listener = TcpListener::bind(SocketAddr::new(args.bind, args.port)).await?;
            let broker = broker::Broker::new(listener);
            let addr = broker.local_addr()?;
            println!("party bus listening on {addr}");
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Join(args) => client::run(args).await?,
    }

    Ok(())
}
