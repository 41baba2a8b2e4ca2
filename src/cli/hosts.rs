use crate::ssh_config::SshConfig;
use crate::{Result, env};

/// Lists the host aliases of ~/.ssh/config
#[derive(Debug, clap::Args)]
#[clap(verbatim_doc_comment)]
pub struct Hosts {}

impl Hosts {
    pub fn run(&self) -> Result<()> {
        let config = SshConfig::read(&*env::SSH_CONFIG_FILE)?;
        for host in config.hosts() {
            println!("{host}");
        }
        Ok(())
    }
}
