//! Clap CLI definitions for Netron.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  netron serve                        Listen on 0.0.0.0:8888
  netron serve --super --demo         Run a hub exposing a demo context
  netron ping 10.0.0.5                Round-trip a ping (default port 8888)
  netron contexts 10.0.0.5:9000       List the contexts a node exposes";

/// Netron: peer-to-peer remote objects.
#[derive(Parser)]
#[command(name = "netron", version, about = "Netron remote object node", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Shared secret for handshake authentication.
    #[arg(long, global = true)]
    pub secret: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until interrupted.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:8888")]
        listen: String,
        /// Relay contexts attached by peers (hub role).
        #[arg(long = "super")]
        is_super: bool,
        /// Expose a demo `Echo` context.
        #[arg(long)]
        demo: bool,
    },
    /// Ping a node.
    Ping {
        /// `host` or `host:port`.
        target: String,
        /// Number of pings.
        #[arg(short, long, default_value_t = 3)]
        count: u32,
    },
    /// List the contexts a node exposes.
    Contexts {
        /// `host` or `host:port`.
        target: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
