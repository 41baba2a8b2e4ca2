use crate::cli::Ctx;
use crate::error::TunnelError;
use crate::Result;
use miette::ensure;

/// Stops running tunnels
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "kill",
    verbatim_doc_comment,
    long_about = "\
Stops running tunnels

Sends SIGTERM to the tunnel's ssh process group and SIGKILL if it is
still around after a 5 second grace period. Stopping a tunnel that is
not running is not an error.

Examples:
  tunnelman stop db               Stop a single tunnel
  tunnelman stop db web           Stop several tunnels
  tunnelman stop --profile prod   Stop every tunnel of a profile
  tunnelman stop --all            Stop every running tunnel"
)]
pub struct Stop {
    /// ID of the tunnel(s) to stop
    id: Vec<String>,
    /// Stop every tunnel of this profile
    #[clap(long, short, conflicts_with = "all")]
    profile: Option<String>,
    /// Stop every running tunnel
    #[clap(long, short)]
    all: bool,
}

impl Stop {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        ensure!(
            self.all || self.profile.is_some() || !self.id.is_empty(),
            "You must provide at least one tunnel to stop"
        );
        let registry = ctx.registry()?;
        if self.all || self.profile.is_some() {
            registry.stop_all(self.profile.as_deref()).await?;
            return Ok(());
        }
        for id in &self.id {
            match registry.stop(id).await {
                Ok(()) => info!("stopped {id}"),
                Err(TunnelError::NotRunning { id }) => info!("tunnel {id} is not running"),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
