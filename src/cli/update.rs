use crate::cli::Ctx;
use crate::cli::add::TunnelFlags;
use crate::Result;

/// Changes a tunnel in tunnels.toml
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Changes a tunnel in tunnels.toml

Only the given flags change. The tunnel must be stopped first.

Examples:
  tunnelman update web --bind-port 8081
  tunnelman update db --auto-connect false --profile prod"
)]
pub struct Update {
    /// ID of the tunnel to change
    id: String,
    #[clap(flatten)]
    flags: TunnelFlags,
}

impl Update {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let registry = ctx.registry()?;
        let mut spec = registry.get(&self.id).await?.spec;
        self.flags.apply(&mut spec)?;
        let tunnel = registry.update(spec).await?;
        info!("updated {} ({})", tunnel.id(), tunnel.spec.display_name());
        Ok(())
    }
}
