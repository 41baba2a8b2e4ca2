use crate::cli::Ctx;
use crate::ui::table::{print_table, tunnel_table};
use crate::Result;
use comfy_table::Cell;
use miette::IntoDiagnostic;

/// List all tunnels
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "ls",
    verbatim_doc_comment,
    long_about = "\
List all tunnels

Displays a table of every configured tunnel with its forward, ssh host,
profile, PID and status. Tunnels started by an earlier invocation are
picked up from the pid ledger.

Example:
  tunnelman list
  tunnelman ls                    Alias for 'list'
  tunnelman list --profile prod   Only tunnels of one profile
  tunnelman list --json           Machine readable output

Output:
  ID    Forward              Host      Profile  PID    Status
  db    L:5432→127.0.0.1:5432  bastion   prod     12345  running
  web   L:8080→localhost:80  bastion   default  -      stopped"
)]
pub struct List {
    /// Only show tunnels of this profile
    #[clap(long, short)]
    profile: Option<String>,
    /// Print JSON instead of a table
    #[clap(long)]
    json: bool,
    /// Hide the table header row
    #[clap(long)]
    hide_header: bool,
}

impl List {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let registry = ctx.registry()?;
        let tunnels = match &self.profile {
            Some(profile) => registry.list_by_profile(profile).await,
            None => registry.list().await,
        };
        if self.json {
            let json = serde_json::to_string_pretty(&tunnels).into_diagnostic()?;
            println!("{json}");
            return Ok(());
        }

        let mut table = tunnel_table(
            &["ID", "Forward", "Host", "Profile", "PID", "Status", ""],
            self.hide_header,
        );
        for tunnel in &tunnels {
            table.add_row(vec![
                Cell::new(tunnel.id()),
                Cell::new(tunnel.spec.display_name()),
                Cell::new(&tunnel.spec.ssh_host),
                Cell::new(&tunnel.spec.profile),
                Cell::new(
                    tunnel
                        .state
                        .pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(tunnel.status().style()),
                Cell::new(tunnel.state.last_error.as_deref().unwrap_or_default()),
            ]);
        }

        print_table(table)
    }
}
