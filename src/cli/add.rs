use crate::cli::Ctx;
use crate::ssh_config::parse_forwarding_spec;
use crate::tunnel::{ForwardKind, TunnelSpec};
use crate::Result;
use miette::ensure;

/// Fields of a tunnel definition, shared by `add` and `update`.
#[derive(Debug, Clone, clap::Args)]
pub struct TunnelFlags {
    /// ssh host (or ~/.ssh/config alias) to connect through
    #[clap(long, short = 'H')]
    pub host: Option<String>,
    /// Forward type: local, remote or dynamic
    #[clap(long = "type", short = 't')]
    pub kind: Option<ForwardKind>,
    /// Compact forward, e.g. 8080:localhost:80, 9000:3000 or 1080
    #[clap(long, short = 'f', conflicts_with_all = ["bind_port", "dest_port"])]
    pub forward: Option<String>,
    /// Listening port
    #[clap(long)]
    pub bind_port: Option<u16>,
    /// Listening address (default 0.0.0.0)
    #[clap(long)]
    pub bind_host: Option<String>,
    /// Where accepted connections go (default 127.0.0.1)
    #[clap(long)]
    pub dest_host: Option<String>,
    #[clap(long)]
    pub dest_port: Option<u16>,
    /// Display name (defaults to the id)
    #[clap(long, short)]
    pub name: Option<String>,
    #[clap(long, short)]
    pub profile: Option<String>,
    /// Start with `tunnelman auto` and `tunnelman watch --auto`
    #[clap(long, num_args = 0..=1, default_missing_value = "true")]
    pub auto_connect: Option<bool>,
    /// Extra ssh arguments, after `--`
    #[clap(last = true)]
    pub extra_args: Vec<String>,
}

impl TunnelFlags {
    /// Applies every flag that was given on top of `spec`.
    pub fn apply(&self, spec: &mut TunnelSpec) -> Result<()> {
        if let Some(host) = &self.host {
            spec.ssh_host = host.clone();
        }
        if let Some(kind) = self.kind {
            spec.kind = kind;
        }
        if let Some(forward) = &self.forward {
            let forward = parse_forwarding_spec(forward, spec.kind).map_err(|e| miette::miette!(e))?;
            spec.bind_port = Some(forward.bind_port);
            spec.dest_port = forward.dest_port;
            if forward.dest_host.is_some() {
                spec.dest_host = forward.dest_host;
            }
        }
        if let Some(port) = self.bind_port {
            spec.bind_port = Some(port);
        }
        if let Some(host) = &self.bind_host {
            spec.bind_host = Some(host.clone());
        }
        if let Some(host) = &self.dest_host {
            spec.dest_host = Some(host.clone());
        }
        if let Some(port) = self.dest_port {
            spec.dest_port = Some(port);
        }
        if let Some(name) = &self.name {
            spec.name = name.clone();
        }
        if let Some(profile) = &self.profile {
            spec.profile = profile.clone();
        }
        if let Some(auto_connect) = self.auto_connect {
            spec.auto_connect = auto_connect;
        }
        if !self.extra_args.is_empty() {
            spec.extra_args = self.extra_args.clone();
        }
        Ok(())
    }
}

/// Adds a tunnel to tunnels.toml
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Adds a tunnel to tunnels.toml

Examples:
  tunnelman add web --host bastion --bind-port 8080 --dest-host localhost --dest-port 80
  tunnelman add web -H bastion -f 8080:localhost:80
  tunnelman add api -H bastion --type remote -f 9000:3000
  tunnelman add socks -H bastion --type dynamic --bind-port 1080 --auto-connect
  tunnelman add db -H bastion -f 5432:db.internal:5432 -- -p 2222 -i ~/.ssh/deploy"
)]
pub struct Add {
    /// ID of the new tunnel
    id: String,
    #[clap(flatten)]
    flags: TunnelFlags,
}

impl Add {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        ensure!(self.flags.host.is_some(), "--host is required");
        let mut spec = TunnelSpec::new(
            &self.id,
            self.flags.kind.unwrap_or(ForwardKind::Local),
            "",
        );
        self.flags.apply(&mut spec)?;
        let tunnel = ctx.registry()?.add(spec).await?;
        info!("added {} ({})", tunnel.id(), tunnel.spec.display_name());
        Ok(())
    }
}
