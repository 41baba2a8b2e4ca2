use crate::cli::Ctx;
use crate::Result;
use miette::ensure;

/// Restarts tunnels
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Restarts tunnels

Stops the tunnel if it is running, waits half a second for the ports to
be released, and starts it again. A stopped tunnel is simply started.

Examples:
  tunnelman restart db
  tunnelman restart db web"
)]
pub struct Restart {
    /// ID of the tunnel(s) to restart
    id: Vec<String>,
}

impl Restart {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        ensure!(!self.id.is_empty(), "At least one tunnel ID must be provided");
        let registry = ctx.registry()?;
        for id in &self.id {
            let tunnel = registry.restart(id).await?;
            info!(
                "restarted {} (pid {})",
                tunnel.id(),
                tunnel.state.pid.unwrap_or_default()
            );
        }
        Ok(())
    }
}
