#[macro_use]
extern crate log;

use tokio::signal;
use tokio::signal::unix::SignalKind;
use tunnelman::{Result, cli};

#[tokio::main]
async fn main() -> Result<()> {
    handle_epipe();
    cli::run().await
}

fn handle_epipe() {
    match signal::unix::signal(SignalKind::pipe()) {
        Ok(mut pipe_stream) => {
            tokio::spawn(async move {
                pipe_stream.recv().await;
                debug!("received SIGPIPE");
            });
        }
        Err(e) => {
            warn!("Could not set up SIGPIPE handler: {e}");
        }
    }
}
