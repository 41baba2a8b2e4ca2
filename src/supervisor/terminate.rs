use super::ProcessSupervisor;
use crate::error::{TunnelError, TunnelResult};
use crate::procs;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// How long to wait for the kernel to report a SIGKILLed process as gone.
const KILL_SETTLE: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl ProcessSupervisor {
    /// Stops the process behind `tunnel_id`: SIGTERM, the grace window, then
    /// SIGKILL. An owned process is signalled as a group; without a handle only
    /// the bare `pid` can be signalled. A process that is already gone counts
    /// as success.
    pub async fn terminate(&self, tunnel_id: &str, pid: u32) -> TunnelResult<()> {
        let tracked = self
            .lock_handles()
            .get(tunnel_id)
            .map(|h| (h.pid, h.exited.clone()));
        match tracked {
            Some((pid, exited)) => self.terminate_group(tunnel_id, pid, exited).await,
            None => self.terminate_pid(tunnel_id, pid).await,
        }
    }

    async fn terminate_group(
        &self,
        tunnel_id: &str,
        pid: u32,
        mut exited: watch::Receiver<bool>,
    ) -> TunnelResult<()> {
        let grace = self.inner.opts.grace;
        debug!("sending SIGTERM to tunnel {tunnel_id} (pgid {pid})");
        let term_err = match signal(pid, Signal::SIGTERM, true) {
            Ok(()) => {
                if wait_exited(&mut exited, pid, grace).await {
                    self.take_handle(tunnel_id, pid);
                    return Ok(());
                }
                warn!("tunnel {tunnel_id} did not exit within {grace:?}, sending SIGKILL");
                None
            }
            Err(Errno::ESRCH) => {
                self.take_handle(tunnel_id, pid);
                return Ok(());
            }
            Err(err) => {
                warn!("SIGTERM to tunnel {tunnel_id} (pgid {pid}) failed: {err}");
                Some(err)
            }
        };
        let result = match (signal(pid, Signal::SIGKILL, true), term_err) {
            (Ok(()) | Err(Errno::ESRCH), _) => Ok(()),
            (Err(kill_err), Some(term_err)) => Err(TunnelError::Termination {
                id: tunnel_id.to_string(),
                pid,
                details: format!("SIGTERM: {term_err}, SIGKILL: {kill_err}"),
            }),
            (Err(kill_err), None) => {
                warn!("SIGKILL to tunnel {tunnel_id} (pgid {pid}) failed: {kill_err}");
                Ok(())
            }
        };
        if result.is_ok() {
            wait_exited(&mut exited, pid, KILL_SETTLE).await;
        }
        self.take_handle(tunnel_id, pid);
        result
    }

    /// Ledger-only knowledge: the process group cannot be reconstructed, so
    /// descendants of `pid` are not reached.
    async fn terminate_pid(&self, tunnel_id: &str, pid: u32) -> TunnelResult<()> {
        debug!("sending SIGTERM to untracked tunnel {tunnel_id} (pid {pid})");
        let term_err = match signal(pid, Signal::SIGTERM, false) {
            Ok(()) => {
                if poll_until_dead(pid, self.inner.opts.grace).await {
                    return Ok(());
                }
                warn!("tunnel {tunnel_id} (pid {pid}) ignored SIGTERM, sending SIGKILL");
                None
            }
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => Some(err),
        };
        match (signal(pid, Signal::SIGKILL, false), term_err) {
            (Ok(()) | Err(Errno::ESRCH), _) => {
                poll_until_dead(pid, KILL_SETTLE).await;
                Ok(())
            }
            (Err(kill_err), Some(term_err)) => Err(TunnelError::Termination {
                id: tunnel_id.to_string(),
                pid,
                details: format!("SIGTERM: {term_err}, SIGKILL: {kill_err}"),
            }),
            (Err(kill_err), None) => {
                warn!("SIGKILL to tunnel {tunnel_id} (pid {pid}) failed: {kill_err}");
                Ok(())
            }
        }
    }

    /// Terminates every owned process concurrently.
    pub async fn bulk_terminate(&self, deadline: Duration) -> TunnelResult<()> {
        let targets = self.tracked();
        self.terminate_all(targets, deadline).await
    }

    /// Terminates `targets` concurrently. Returns once all are done or the
    /// deadline passes; stragglers keep being killed in the background.
    pub async fn terminate_all(
        &self,
        targets: Vec<(String, u32)>,
        deadline: Duration,
    ) -> TunnelResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        info!("stopping {} tunnel(s)", targets.len());
        let until = Instant::now() + deadline;
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(id, pid)| {
                let supervisor = self.clone();
                let task_id = id.clone();
                let task = tokio::spawn(async move { supervisor.terminate(&task_id, pid).await });
                (id, task)
            })
            .collect();

        let mut failed = vec![];
        let mut pending = 0;
        for (id, task) in tasks {
            match time::timeout_at(until, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!("{err}");
                    failed.push(id);
                }
                Ok(Err(err)) => {
                    error!("terminate task for tunnel {id} panicked: {err}");
                    failed.push(id);
                }
                Err(_) => pending += 1,
            }
        }
        if pending > 0 {
            return Err(TunnelError::DeadlineExceeded { pending });
        }
        if !failed.is_empty() {
            return Err(TunnelError::BatchFailed {
                operation: "stop".to_string(),
                failed,
            });
        }
        Ok(())
    }
}

fn signal(pid: u32, signal: Signal, group: bool) -> Result<(), Errno> {
    // pid 0 and negative values would address our own group or everything
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(Errno::ESRCH),
    };
    if group {
        killpg(Pid::from_raw(raw), signal)
    } else {
        kill(Pid::from_raw(raw), signal)
    }
}

/// True once the waiter reports the exit. If the waiter is gone without
/// reporting, falls back to probing the pid.
async fn wait_exited(exited: &mut watch::Receiver<bool>, pid: u32, within: Duration) -> bool {
    // the watch::Ref must not live across the await below
    let reported = time::timeout(within, exited.wait_for(|exited| *exited))
        .await
        .map(|r| r.is_ok());
    match reported {
        Ok(true) => true,
        Ok(false) => poll_until_dead(pid, within).await,
        Err(_) => false,
    }
}

async fn poll_until_dead(pid: u32, within: Duration) -> bool {
    let until = Instant::now() + within;
    loop {
        if !procs::is_alive(pid) {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        time::sleep(POLL_INTERVAL).await;
    }
}
