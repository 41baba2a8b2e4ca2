use crate::cli::Ctx;
use crate::Result;

/// Removes a tunnel from tunnels.toml
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "rm",
    verbatim_doc_comment,
    long_about = "\
Removes a tunnel from tunnels.toml

The tunnel must be stopped first. The previous file is kept as
tunnels.toml.backup.

Example:
  tunnelman remove web"
)]
pub struct Remove {
    /// ID of the tunnel to remove
    id: String,
}

impl Remove {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        ctx.registry()?.remove(&self.id).await?;
        info!("removed {}", self.id);
        Ok(())
    }
}
