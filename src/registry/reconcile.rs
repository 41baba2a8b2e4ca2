use super::{Table, TunnelRegistry};
use crate::pid_ledger::{PidLedger, PidMap};
use crate::procs;
use crate::tunnel_status::TunnelStatus;
use chrono::Utc;

/// Aligns freshly loaded specs with the ledger and the OS. Tunnels whose
/// recorded process is still alive come back as Running; records for deleted
/// specs or dead processes are dropped. Returns the recovered ids.
pub(super) fn reconcile_on_startup(tunnels: &mut Table, ledger: &PidLedger) -> Vec<String> {
    let records = match ledger.load() {
        Ok(records) => records,
        Err(err) => {
            warn!("could not read pid ledger, assuming nothing is running: {err}");
            return vec![];
        }
    };
    let mut kept = PidMap::new();
    let mut recovered = vec![];
    let mut changed = false;
    for (id, record) in records {
        let Some(entry) = tunnels.get_mut(&id) else {
            info!("dropping ledger entry for deleted tunnel {id} (pid {})", record.pid);
            changed = true;
            continue;
        };
        if !procs::is_alive(record.pid) {
            debug!("tunnel {id} (pid {}) is gone", record.pid);
            changed = true;
            continue;
        }
        let started_at = record.started_at().unwrap_or_else(|| {
            debug!("unparseable start time for tunnel {id}: {}", record.started);
            Utc::now()
        });
        entry.state.status = TunnelStatus::Running;
        entry.state.pid = Some(record.pid);
        entry.state.started_at = Some(started_at);
        info!("recovered tunnel {id} (pid {})", record.pid);
        recovered.push(id.clone());
        kept.insert(id, record);
    }
    if changed && let Err(err) = ledger.save(&kept) {
        warn!("failed to rewrite pid ledger: {err}");
    }
    recovered
}

impl TunnelRegistry {
    /// Marks recovered tunnels whose process died as Stopped. Owned processes
    /// are covered by their exit waiters and are skipped. Returns the ids that
    /// changed.
    pub async fn refresh(&self) -> Vec<String> {
        let candidates: Vec<(String, u32)> = {
            let tunnels = self.inner.tunnels.read().await;
            tunnels
                .values()
                .filter(|e| e.is_running())
                .filter_map(|e| Some((e.spec.id.clone(), e.state.pid?)))
                .filter(|(id, pid)| self.inner.supervisor.tracked_pid(id) != Some(*pid))
                .collect()
        };
        let dead: Vec<(String, u32)> = candidates
            .into_iter()
            .filter(|(_, pid)| !procs::is_alive(*pid))
            .collect();
        if dead.is_empty() {
            return vec![];
        }

        let mut changed = vec![];
        {
            let mut tunnels = self.inner.tunnels.write().await;
            for (id, pid) in dead {
                let Some(entry) = tunnels.get_mut(&id) else {
                    continue;
                };
                if !entry.is_running() || entry.state.pid != Some(pid) {
                    continue;
                }
                let error = format!("process {pid} is no longer running");
                entry.state.status = TunnelStatus::Stopped;
                entry.state.clear_process();
                entry.state.last_error = Some(error.clone());
                changed.push((id, error));
            }
        }
        if changed.is_empty() {
            return vec![];
        }
        self.persist_ledger().await;
        changed
            .into_iter()
            .map(|(id, error)| {
                info!("tunnel {id}: {error}");
                self.emit(&id, TunnelStatus::Running, TunnelStatus::Stopped, Some(error));
                id
            })
            .collect()
    }
}
