use super::{TunnelRegistry, not_found};
use crate::error::{TunnelError, TunnelResult, error_chain};
use crate::supervisor::ProcessExit;
use crate::tunnel_status::{Tunnel, TunnelStatus};
use tokio::sync::oneshot;

impl TunnelRegistry {
    /// Stopped/Error → Connecting → Running, or Connecting → Error when ssh
    /// cannot be spawned. Rejects tunnels that are already Connecting or Running.
    pub async fn start(&self, id: &str) -> TunnelResult<Tunnel> {
        let (spec, old) = {
            let mut tunnels = self.inner.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(id) else {
                return Err(not_found(&tunnels, id));
            };
            if entry.state.status.is_active() {
                return Err(TunnelError::AlreadyActive {
                    id: id.to_string(),
                    status: entry.state.status,
                });
            }
            entry.spec.validate()?;
            let old = entry.state.status;
            entry.state.status = TunnelStatus::Connecting;
            (entry.spec.clone(), old)
        };
        self.emit(id, old, TunnelStatus::Connecting, None);
        debug!("starting tunnel {id} ({})", spec.display_name());

        let spawned = match self.inner.supervisor.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(err) => {
                let msg = error_chain(&err);
                error!("{msg}");
                {
                    let mut tunnels = self.inner.tunnels.write().await;
                    if let Some(entry) = tunnels.get_mut(id) {
                        entry.state.status = TunnelStatus::Error;
                        entry.state.clear_process();
                        entry.state.last_error = Some(msg.clone());
                    }
                }
                self.emit(id, TunnelStatus::Connecting, TunnelStatus::Error, Some(msg));
                return Err(err);
            }
        };

        let tunnel = {
            let mut tunnels = self.inner.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(id) else {
                return Err(not_found(&tunnels, id));
            };
            entry.state.status = TunnelStatus::Running;
            entry.state.pid = Some(spawned.pid);
            entry.state.started_at = Some(spawned.started_at);
            entry.state.last_error = None;
            entry.view()
        };
        self.persist_ledger().await;
        // Running must be queued before the watcher can report the exit
        self.emit(id, TunnelStatus::Connecting, TunnelStatus::Running, None);
        self.watch_exit(id, spawned.pid, spawned.exit);
        Ok(tunnel)
    }

    /// Running → Stopped. Termination failures are logged; once the signals
    /// have been sent the tunnel is considered stopped either way.
    pub async fn stop(&self, id: &str) -> TunnelResult<()> {
        let pid = {
            let mut tunnels = self.inner.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(id) else {
                return Err(not_found(&tunnels, id));
            };
            match entry.state.pid {
                Some(pid) if entry.is_running() => {
                    entry.stopping = true;
                    pid
                }
                _ => return Err(TunnelError::NotRunning { id: id.to_string() }),
            }
        };
        self.stop_watching(id);
        info!("stopping tunnel {id} (pid {pid})");
        if let Err(err) = self.inner.supervisor.terminate(id, pid).await {
            warn!("{}", error_chain(&err));
        }
        {
            let mut tunnels = self.inner.tunnels.write().await;
            if let Some(entry) = tunnels.get_mut(id) {
                entry.stopping = false;
                entry.state.status = TunnelStatus::Stopped;
                entry.state.clear_process();
            }
        }
        self.persist_ledger().await;
        self.emit(id, TunnelStatus::Running, TunnelStatus::Stopped, None);
        Ok(())
    }

    /// Stops the tunnel if it is running, pauses briefly, and starts it again.
    pub async fn restart(&self, id: &str) -> TunnelResult<Tunnel> {
        match self.stop(id).await {
            Ok(()) => tokio::time::sleep(self.inner.opts.restart_pause).await,
            Err(TunnelError::NotRunning { .. }) => {}
            Err(err) => return Err(err),
        }
        self.start(id).await
    }

    fn watch_exit(&self, id: &str, pid: u32, exit: oneshot::Receiver<ProcessExit>) {
        let registry = self.clone();
        let task = tokio::spawn(async move {
            // a dropped sender means the handle was torn down by a stop
            if let Ok(exit) = exit.await {
                registry.on_process_exit(exit).await;
            }
        });
        let previous = self
            .lock_watchers()
            .insert(id.to_string(), (pid, task.abort_handle()));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    fn stop_watching(&self, id: &str) {
        if let Some((_, watcher)) = self.lock_watchers().remove(id) {
            watcher.abort();
        }
    }

    /// Exit-detection path: only a tunnel still Running with this very pid is
    /// moved to Stopped; an explicit stop may already have won the race.
    async fn on_process_exit(&self, exit: ProcessExit) {
        let id = exit.tunnel_id.as_str();
        {
            let mut watchers = self.lock_watchers();
            if watchers.get(id).is_some_and(|(pid, _)| *pid == exit.pid) {
                watchers.remove(id);
            }
        }
        let error = exit.error();
        {
            let mut tunnels = self.inner.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(id) else {
                return;
            };
            if !entry.is_running() || entry.state.pid != Some(exit.pid) {
                return;
            }
            entry.state.status = TunnelStatus::Stopped;
            entry.state.clear_process();
            entry.state.last_error = error.clone();
        }
        self.persist_ledger().await;
        self.emit(id, TunnelStatus::Running, TunnelStatus::Stopped, error);
    }
}
