//! Run the HTTP server in the foreground, without supervision

use anyhow::Result;
use warden::config::Config;
use warden::server;

pub fn run(config: &Config) -> Result<()> {
    let addr = config.server.socket_addr()?;
    println!("Serving on http://{} (Ctrl-C to stop)", addr);
    server::run_blocking(&config.server)
}
