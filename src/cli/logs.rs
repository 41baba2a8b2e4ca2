use crate::output::TunnelLogs;
use crate::tunnel::validate_id;
use crate::{Result, env};
use miette::IntoDiagnostic;
use std::fs;
use std::io;

/// Displays the ssh diagnostics of a tunnel
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "l",
    verbatim_doc_comment,
    long_about = "\
Displays the ssh diagnostics of a tunnel

Logs are only written for tunnels started with --debug, which runs ssh
with -v and records the exact command line.

Examples:
  tunnelman --debug start db      Start with diagnostics
  tunnelman logs db               Show the last 100 lines
  tunnelman logs db -n 20         Show the last 20 lines
  tunnelman logs db --path        Print the log file location"
)]
pub struct Logs {
    /// ID of the tunnel
    id: String,
    /// Number of lines to show
    #[clap(short, default_value_t = 100)]
    n: usize,
    /// Print the path of the log file instead
    #[clap(long)]
    path: bool,
}

impl Logs {
    pub async fn run(&self) -> Result<()> {
        validate_id(&self.id)?;
        let path = TunnelLogs::path_for(&env::TUNNELMAN_LOGS_DIR, &self.id);
        if self.path {
            println!("{}", path.display());
            return Ok(());
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("no logs for {} yet, start it with --debug", self.id);
                return Ok(());
            }
            Err(err) => return Err(err).into_diagnostic(),
        };
        for line in tail(&raw, self.n) {
            println!("{}", format_line(line, &self.id));
        }
        Ok(())
    }
}

fn tail(raw: &str, n: usize) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = raw.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip)
}

/// Dims the timestamp and drops the redundant tunnel id.
fn format_line(line: &str, id: &str) -> String {
    let mut parts = line.splitn(4, ' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(date), Some(time), Some(line_id), Some(msg)) if line_id == id => {
            format!("{} {msg}", console::style(format!("{date} {time}")).dim())
        }
        _ => line.to_string(),
    }
}
