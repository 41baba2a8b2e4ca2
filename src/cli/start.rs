use crate::cli::Ctx;
use crate::error::TunnelError;
use crate::Result;
use miette::ensure;

/// Starts tunnels from tunnels.toml
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "s",
    verbatim_doc_comment,
    long_about = "\
Starts tunnels from tunnels.toml

Each tunnel runs its own ssh process, detached from tunnelman. The
process keeps running after this command returns; later invocations find
it again through the pid ledger.

With --debug, ssh runs with -v and its output goes to the tunnel's log
file for as long as tunnelman runs. Use 'tunnelman watch' to keep it
captured.

Examples:
  tunnelman start db              Start a single tunnel
  tunnelman start db web          Start several tunnels
  tunnelman start --profile prod  Start every tunnel of a profile
  tunnelman start --all           Start every tunnel"
)]
pub struct Start {
    /// ID of the tunnel(s) to start
    id: Vec<String>,
    /// Start every tunnel of this profile
    #[clap(long, short, conflicts_with = "all")]
    profile: Option<String>,
    /// Start every tunnel
    #[clap(long, short)]
    all: bool,
}

impl Start {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        ensure!(
            self.all || self.profile.is_some() || !self.id.is_empty(),
            "At least one tunnel ID must be provided"
        );
        let registry = ctx.registry()?;
        if self.all || self.profile.is_some() {
            let started = registry.start_all(self.profile.as_deref()).await?;
            for tunnel in started {
                info!("started {} (pid {})", tunnel.id(), tunnel.state.pid.unwrap_or_default());
            }
            return Ok(());
        }

        let mut failed = vec![];
        for id in &self.id {
            match registry.start(id).await {
                Ok(tunnel) => info!(
                    "started {} (pid {})",
                    tunnel.id(),
                    tunnel.state.pid.unwrap_or_default()
                ),
                Err(TunnelError::AlreadyActive { id, status }) => {
                    warn!("tunnel {id} is already {status}")
                }
                Err(err) if self.id.len() == 1 => return Err(err.into()),
                Err(err) => {
                    error!("{err}");
                    failed.push(id.clone());
                }
            }
        }
        if !failed.is_empty() {
            return Err(TunnelError::BatchFailed {
                operation: "start".to_string(),
                failed,
            }
            .into());
        }
        Ok(())
    }
}
