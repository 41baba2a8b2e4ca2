use crate::output::{NullSink, OutputSink, TunnelLogs};
use crate::pid_ledger::PidLedger;
use crate::registry::{RegistryOptions, TunnelRegistry};
use crate::supervisor::{GRACE_WINDOW, ProcessSupervisor, SupervisorOptions};
use crate::tunnels_toml::FileSpecStore;
use crate::{Result, env, logger};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod add;
mod auto;
mod hosts;
mod import;
mod list;
mod logs;
mod profiles;
mod remove;
mod restart;
mod start;
mod status;
mod stop;
mod update;
mod watch;

#[derive(Debug, clap::Parser)]
#[clap(name = "tunnelman", version, about = "Manage long-running ssh tunnels")]
struct Cli {
    /// Path to tunnels.toml
    #[clap(long, global = true, env = "TUNNELMAN_CONFIG")]
    config: Option<PathBuf>,
    /// Debug logging, and pass -v to ssh with its output in the tunnel logs
    #[clap(long, global = true)]
    debug: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Add(add::Add),
    Auto(auto::Auto),
    Hosts(hosts::Hosts),
    Import(import::Import),
    List(list::List),
    Logs(logs::Logs),
    Profiles(profiles::Profiles),
    Remove(remove::Remove),
    Restart(restart::Restart),
    Start(start::Start),
    Status(status::Status),
    Stop(stop::Stop),
    Update(update::Update),
    Watch(watch::Watch),
}

/// What every subcommand needs to reach the tunnels.
#[derive(Debug)]
pub struct Ctx {
    pub config: PathBuf,
    pub debug: bool,
}

impl Ctx {
    /// Builds a registry over the config file and the pid ledger. Tunnels
    /// started by an earlier invocation are recovered here.
    pub fn registry(&self) -> Result<TunnelRegistry> {
        let sink: Arc<dyn OutputSink> = if self.debug {
            Arc::new(TunnelLogs::new(env::TUNNELMAN_LOGS_DIR.clone()))
        } else {
            Arc::new(NullSink)
        };
        let supervisor = ProcessSupervisor::new(
            SupervisorOptions {
                ssh_program: env::TUNNELMAN_SSH_BIN.clone(),
                grace: GRACE_WINDOW,
                verbose: self.debug,
            },
            sink,
        );
        let registry = TunnelRegistry::new(
            Arc::new(FileSpecStore::new(self.config.clone())),
            PidLedger::new(env::TUNNELMAN_PID_FILE.clone()),
            supervisor,
            RegistryOptions::default(),
        )?;
        Ok(registry)
    }
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    logger::init(args.debug);
    let ctx = Ctx {
        config: args
            .config
            .unwrap_or_else(|| env::TUNNELMAN_CONFIG_FILE.clone()),
        debug: args.debug,
    };
    match args.command {
        Command::Add(add) => add.run(&ctx).await,
        Command::Auto(auto) => auto.run(&ctx).await,
        Command::Hosts(hosts) => hosts.run(),
        Command::Import(import) => import.run(&ctx).await,
        Command::List(list) => list.run(&ctx).await,
        Command::Logs(logs) => logs.run().await,
        Command::Profiles(profiles) => profiles.run(&ctx).await,
        Command::Remove(remove) => remove.run(&ctx).await,
        Command::Restart(restart) => restart.run(&ctx).await,
        Command::Start(start) => start.run(&ctx).await,
        Command::Status(status) => status.run(&ctx).await,
        Command::Stop(stop) => stop.run(&ctx).await,
        Command::Update(update) => update.run(&ctx).await,
        Command::Watch(watch) => watch.run(&ctx).await,
    }
}
