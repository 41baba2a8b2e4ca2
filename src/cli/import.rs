use crate::cli::Ctx;
use crate::ssh_config::SshConfig;
use crate::{Result, env};

/// Imports the forwards of an ~/.ssh/config host as tunnels
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Imports the forwards of an ~/.ssh/config host as tunnels

Every LocalForward, RemoteForward and DynamicForward of the host becomes
one tunnel named <host>-local-<n>, <host>-remote-<n> or <host>-dynamic-<n>.
Tunnels that already exist are left alone.

Examples:
  tunnelman import bastion
  tunnelman hosts                 List the hosts that can be imported"
)]
pub struct Import {
    /// Host alias from ~/.ssh/config
    host: String,
}

impl Import {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let specs = SshConfig::read(&*env::SSH_CONFIG_FILE)?.to_specs(&self.host)?;
        if specs.is_empty() {
            warn!("host {} has no forwards to import", self.host);
            return Ok(());
        }
        let added = ctx.registry()?.import(specs).await?;
        if added.is_empty() {
            info!("nothing to import, every forward of {} already exists", self.host);
        }
        for id in added {
            info!("imported {id}");
        }
        Ok(())
    }
}
