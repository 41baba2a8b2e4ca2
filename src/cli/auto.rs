use crate::cli::Ctx;
use crate::Result;

/// Starts the tunnels marked auto_connect
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Starts the tunnels marked auto_connect

Tunnels that are already running are skipped. The tunnels keep running
after this command returns. Handy in a login script.

Examples:
  tunnelman auto                  Every auto_connect tunnel
  tunnelman auto prod             Only those of the prod profile"
)]
pub struct Auto {
    /// Only tunnels of this profile
    profile: Option<String>,
}

impl Auto {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let started = ctx
            .registry()?
            .auto_connect(self.profile.as_deref())
            .await?;
        for tunnel in started {
            info!("started {} (pid {})", tunnel.id(), tunnel.state.pid.unwrap_or_default());
        }
        Ok(())
    }
}
