use super::TunnelRegistry;
use crate::error::{TunnelError, TunnelResult, error_chain};
use crate::tunnel_status::{Tunnel, TunnelStatus};
use std::time::Duration;

impl TunnelRegistry {
    /// Starts every tunnel of `profile` (all tunnels when `None`) one after
    /// another. One failure does not abort the rest; the names of the failed
    /// tunnels are reported together at the end.
    pub async fn start_all(&self, profile: Option<&str>) -> TunnelResult<Vec<Tunnel>> {
        let targets = self
            .select(|e| profile.is_none_or(|p| e.spec.in_profile(p)))
            .await;
        self.start_each(targets).await
    }

    /// Starts the auto-connect tunnels of `profile` that are not already up.
    pub async fn auto_connect(&self, profile: Option<&str>) -> TunnelResult<Vec<Tunnel>> {
        let targets = self
            .select(|e| {
                e.spec.auto_connect
                    && !e.state.status.is_active()
                    && profile.is_none_or(|p| e.spec.in_profile(p))
            })
            .await;
        if targets.is_empty() {
            debug!("no tunnels to auto-connect");
        }
        self.start_each(targets).await
    }

    async fn start_each(&self, targets: Vec<(String, String)>) -> TunnelResult<Vec<Tunnel>> {
        let mut started = vec![];
        let mut failed = vec![];
        for (i, (id, name)) in targets.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inner.opts.start_spacing).await;
            }
            match self.start(&id).await {
                Ok(tunnel) => started.push(tunnel),
                Err(TunnelError::AlreadyActive { .. }) => debug!("tunnel {id} is already up"),
                Err(err) => {
                    warn!("{}", error_chain(&err));
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            return Err(TunnelError::BatchFailed {
                operation: "start".to_string(),
                failed,
            });
        }
        Ok(started)
    }

    /// Stops every running tunnel of `profile` (all when `None`) concurrently.
    pub async fn stop_all(&self, profile: Option<&str>) -> TunnelResult<()> {
        let targets = self
            .select(|e| e.is_running() && profile.is_none_or(|p| e.spec.in_profile(p)))
            .await;
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(id, name)| {
                let registry = self.clone();
                (name, tokio::spawn(async move { registry.stop(&id).await }))
            })
            .collect();

        let mut failed = vec![];
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                // raced with an exit or another stop
                Ok(Err(err)) if err.is_not_found() => {}
                Ok(Err(err)) => {
                    warn!("{}", error_chain(&err));
                    failed.push(name);
                }
                Err(err) => {
                    error!("stop task for tunnel {name} panicked: {err}");
                    failed.push(name);
                }
            }
        }
        if !failed.is_empty() {
            return Err(TunnelError::BatchFailed {
                operation: "stop".to_string(),
                failed,
            });
        }
        Ok(())
    }

    /// Terminates everything this registry knows to be running, owned or
    /// recovered, and waits at most `deadline`. Bookkeeping is cleared for all
    /// of them regardless of the outcome.
    pub async fn shutdown(&self, deadline: Duration) -> TunnelResult<()> {
        let mut targets: Vec<(String, u32)> = {
            let mut tunnels = self.inner.tunnels.write().await;
            tunnels
                .values_mut()
                .filter(|e| e.is_running())
                .filter_map(|e| {
                    let pid = e.state.pid?;
                    e.stopping = true;
                    Some((e.spec.id.clone(), pid))
                })
                .collect()
        };
        for (id, pid) in self.inner.supervisor.tracked() {
            if !targets.iter().any(|(t, _)| *t == id) {
                targets.push((id, pid));
            }
        }
        {
            let mut watchers = self.lock_watchers();
            for (_, (_, watcher)) in watchers.drain() {
                watcher.abort();
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let result = self
            .inner
            .supervisor
            .terminate_all(targets.clone(), deadline)
            .await;

        let mut stopped = vec![];
        {
            let mut tunnels = self.inner.tunnels.write().await;
            for (id, _) in &targets {
                let Some(entry) = tunnels.get_mut(id) else {
                    continue;
                };
                entry.stopping = false;
                if entry.state.status.is_running() {
                    entry.state.status = TunnelStatus::Stopped;
                    entry.state.clear_process();
                    stopped.push(id.clone());
                }
            }
        }
        self.persist_ledger().await;
        for id in stopped {
            self.emit(&id, TunnelStatus::Running, TunnelStatus::Stopped, None);
        }
        result
    }
}
