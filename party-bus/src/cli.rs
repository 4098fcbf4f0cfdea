use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::broker::is_valid_session_id;

const NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// A simple command line to start/join a party bus
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a party bus relay server.
    #[command(visible_alias = "c")]
    Create(CreateArgs),
    /// Join a party bus session.
    #[command(visible_alias = "j")]
    Join(JoinArgs),
}

impl Command {
    pub fn log_level(&self) -> u8 {
        match self {
            Command::Create(args) => args.log_level,
            Command::Join(args) => args.log_level,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port on which to listen. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080, env = "PARTYBUS_PORT")]
    pub port: u16,

    /// Log level: 0=disabled, 1=error, 2=warn, 3=info, 4=debug.
    #[arg(short = 'l', long = "log-level", default_value_t = 4)]
    pub log_level: u8,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Party bus server to connect to. A path in the URL selects the session.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub host: String,

    /// Session to join (ignored if a path is given in `--host`). Random by default.
    #[arg(short = 's', long = "session")]
    pub session: Option<String>,

    /// Identifier of this local peer. Random by default.
    #[arg(long)]
    pub id: Option<String>,

    /// Log level: 0=disabled, 1=error, 2=warn, 3=info, 4=debug.
    #[arg(short = 'l', long = "log-level", default_value_t = 0)]
    pub log_level: u8,
}

/// Where `join` should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    /// `host:port` of the relay.
    pub host: String,
    pub session: String,
    pub id: String,
}

impl JoinArgs {
    pub fn target(&self) -> Result<JoinTarget> {
        let url = Url::parse(&self.host)
            .with_context(|| format!("invalid party bus url '{}'", self.host))?;
        let host = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => bail!("party bus url '{}' has no host", self.host),
        };

        let session = match url.path().trim_matches('/') {
            "" => self.session.clone().unwrap_or_else(random_name),
            path => path.to_string(),
        };
        if !is_valid_session_id(&session) {
            bail!("session id '{session}' may only contain letters, digits and '-'");
        }

        let id = self.id.clone().unwrap_or_else(random_name);
        Ok(JoinTarget { host, session, id })
    }
}

/// Random identifier usable both as a peer id and as a session path segment.
pub fn random_name() -> String {
    nanoid::nanoid!(10, &NAME_ALPHABET)
}
