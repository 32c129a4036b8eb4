//! pid1d, the in-guest supervisor agent.
//!
//! Runs as the init process of a VM-backed container and serves the agent
//! protocol on stdio. All logging goes to stderr so the protocol stream
//! stays clean.

use agent::server::AgentServer;
use log::{error, info};
use std::io;

fn main() {
    env_logger::init();
    info!("pid1d starting (pid = {})", std::process::id());

    let stdin = io::stdin();
    let stdout = io::stdout();

    let mut server = AgentServer::new();
    if let Err(e) = server.serve(stdin.lock(), stdout.lock()) {
        error!("agent session ended: {}", e);
        std::process::exit(1);
    }
    info!("pid1d exiting");
}
