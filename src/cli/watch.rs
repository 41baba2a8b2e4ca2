use crate::cli::Ctx;
use crate::tunnel_status::{StatusChangeEvent, TunnelStatus};
use crate::{Result, env};
use miette::IntoDiagnostic;
use tokio::time;

/// Runs in the foreground and reports tunnel status changes
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Runs in the foreground and reports tunnel status changes

Prints every status change as it happens and periodically checks that
tunnels started by earlier invocations are still alive. On Ctrl-C the
tunnels keep running unless --stop-on-exit is given.

With --debug, ssh output of tunnels started here is captured in their
log files for as long as watch runs.

Examples:
  tunnelman watch
  tunnelman watch --auto default  Auto-connect a profile first
  tunnelman watch --stop-on-exit  Stop everything on Ctrl-C"
)]
pub struct Watch {
    /// Auto-connect the tunnels of this profile on startup
    #[clap(long)]
    auto: Option<String>,
    /// Stop every running tunnel when watch exits
    #[clap(long)]
    stop_on_exit: bool,
}

impl Watch {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let registry = ctx.registry()?;
        let Some(mut events) = registry.take_events() else {
            miette::bail!("event queue already taken");
        };
        if let Some(profile) = &self.auto
            && let Err(err) = registry.auto_connect(Some(profile)).await
        {
            // individual failures are visible in the event stream too
            warn!("{err}");
        }
        let running = registry
            .list()
            .await
            .into_iter()
            .filter(|t| t.status().is_running())
            .count();
        info!("watching {running} running tunnel(s), press Ctrl-C to exit");

        let mut sweep = time::interval(*env::TUNNELMAN_REFRESH_INTERVAL);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(event) = events.recv() => print_event(&event),
                _ = sweep.tick() => {
                    registry.refresh().await;
                }
                res = tokio::signal::ctrl_c() => {
                    res.into_diagnostic()?;
                    break;
                }
            }
        }

        if self.stop_on_exit {
            info!("stopping all tunnels");
            registry.shutdown(*env::TUNNELMAN_STOP_TIMEOUT).await?;
            while let Ok(event) = events.try_recv() {
                print_event(&event);
            }
        } else {
            info!("leaving tunnels running");
        }
        Ok(())
    }
}

fn print_event(event: &StatusChangeEvent) {
    let line = format!(
        "{} {} → {}",
        event.id,
        event.old_status.style(),
        event.new_status.style()
    );
    match &event.error {
        Some(err) if event.new_status == TunnelStatus::Error => error!("{line}: {err}"),
        Some(err) => warn!("{line}: {err}"),
        None => info!("{line}"),
    }
}
