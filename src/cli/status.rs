use crate::cli::Ctx;
use crate::procs::PROCS;
use crate::Result;

/// Display the status of a tunnel
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "stat",
    verbatim_doc_comment,
    long_about = "\
Display the status of a tunnel

Shows the forward, ssh host, PID and current status of a single tunnel,
along with the last error if it stopped unexpectedly.

Example:
  tunnelman status db

Output:
  ID: db
  Name: Production database
  Forward: L:5432→127.0.0.1:5432 via bastion
  PID: 12345 (ssh)
  Started: 2024-05-01 10:00:00 UTC
  Status: running"
)]
pub struct Status {
    /// ID of the tunnel to check
    pub id: String,
}

impl Status {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let tunnel = ctx.registry()?.get(&self.id).await?;
        println!("ID: {}", tunnel.id());
        println!("Name: {}", tunnel.spec.name);
        println!(
            "Forward: {} via {}",
            tunnel.spec.display_name(),
            tunnel.spec.ssh_host
        );
        println!("Profile: {}", tunnel.spec.profile);
        if let Some(pid) = tunnel.state.pid {
            match PROCS.title(pid) {
                Some(title) => println!("PID: {pid} ({title})"),
                None => println!("PID: {pid}"),
            }
        }
        if let Some(started) = tunnel.state.started_at {
            println!("Started: {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        println!("Status: {}", tunnel.status().style());
        if let Some(err) = &tunnel.state.last_error {
            println!("Last error: {err}");
        }
        Ok(())
    }
}
