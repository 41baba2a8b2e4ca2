use crate::cli::Ctx;
use crate::Result;

/// Lists the profiles used in tunnels.toml
#[derive(Debug, clap::Args)]
pub struct Profiles {}

impl Profiles {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        for profile in ctx.registry()?.profiles().await {
            println!("{profile}");
        }
        Ok(())
    }
}
