//! Command-line surface of `mountctl`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mountplane_types::PeerRole;

use crate::constants::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "mountctl")]
#[command(about = "Drive the mountplane helper and service from the foreground")]
pub struct Cli {
    /// Directory holding the helper and service sockets
    #[arg(long, env = "MOUNTPLANE_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (or replace) the helper's mount
    Create {
        #[arg(long)]
        mountpoint: PathBuf,
        /// Display name; defaults to the mountpoint's last component
        #[arg(long)]
        label: Option<String>,
        #[arg(long, default_value_t = whoami::username())]
        user: String,
        #[arg(long, env = "MOUNTPLANE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Connect right after creating
        #[arg(long)]
        connect: bool,
    },
    /// Connect the mount and wait for the outcome
    Connect,
    /// Disconnect the mount
    Disconnect,
    /// Tear the mount down and make the helper exit
    Kill,
    /// Ask the running app to connect or disconnect the mount
    Toggle,
    /// Print the helper's view of the mount
    Status,
    /// Turn the local cache on or off
    Cache {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Set the mount's icon
    Icon { path: PathBuf },
    /// Move the mountpoint
    Mountpoint { path: PathBuf },
    /// Replace the trusted host key fingerprints
    Fingerprints { fingerprints: Vec<String> },
    /// Print mount transitions until interrupted
    Watch {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Publish an endpoint for a peer role on the service
    Publish { role: PeerRole, socket: PathBuf },
    /// Fetch the endpoint published for a peer role
    Fetch {
        role: PeerRole,
        /// Poll until one is published
        #[arg(long)]
        wait: bool,
    },
    /// Withdraw the endpoint published for a peer role
    Withdraw { role: PeerRole },
    /// Export the App interface, publish it, and mirror mount state
    ServeApp {
        /// Socket to listen on; defaults to app.sock in the socket dir
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Account email announced on the local bus
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}
