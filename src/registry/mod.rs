//! Tunnel registry: the authoritative table of tunnel specs and their runtime
//! state.
//!
//! This module is split into focused submodules:
//! - `state`: configuration mutations (add/update/remove/import)
//! - `lifecycle`: start/stop/restart and the exit-detection path
//! - `batch`: profile-wide start/stop, auto-connect and full shutdown
//! - `reconcile`: startup reconciliation against the pid ledger and the
//!   liveness sweep for recovered tunnels
//!
//! Every status transition is published on a bounded queue. Delivery is
//! best-effort: when the queue is full the event is dropped, so consumers
//! must re-read state from the registry instead of relying on the stream.

mod batch;
mod lifecycle;
mod reconcile;
mod state;

use crate::error::{TunnelError, TunnelResult, find_similar_tunnel};
use crate::pid_ledger::{PidLedger, PidMap, PidRecord};
use crate::supervisor::ProcessSupervisor;
use crate::tunnel::TunnelSpec;
use crate::tunnel_status::{StatusChangeEvent, Tunnel, TunnelRuntimeState, TunnelStatus};
use crate::tunnels_toml::SpecStore;
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::AbortHandle;

pub const EVENT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Pause between successive starts of a batch
    pub start_spacing: Duration,
    /// Pause between the stop and the start of a restart
    pub restart_pause: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            start_spacing: Duration::from_millis(200),
            restart_pause: Duration::from_millis(500),
        }
    }
}

struct Entry {
    spec: TunnelSpec,
    state: TunnelRuntimeState,
    /// Set while a stop is in flight so exits and sweeps leave it alone
    stopping: bool,
}

impl Entry {
    fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            state: TunnelRuntimeState::default(),
            stopping: false,
        }
    }

    fn view(&self) -> Tunnel {
        Tunnel {
            spec: self.spec.clone(),
            state: self.state.clone(),
        }
    }

    fn is_running(&self) -> bool {
        self.state.status.is_running() && !self.stopping
    }
}

type Table = IndexMap<String, Entry>;

#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    tunnels: RwLock<Table>,
    store: Arc<dyn SpecStore>,
    ledger: PidLedger,
    /// Serializes snapshot-and-save of the ledger
    ledger_lock: Mutex<()>,
    /// Serializes load-mutate-save of the configuration
    config_lock: Mutex<()>,
    supervisor: ProcessSupervisor,
    opts: RegistryOptions,
    events_tx: mpsc::Sender<StatusChangeEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<StatusChangeEvent>>>,
    /// Exit watchers keyed by tunnel id, tagged with the pid they watch
    watchers: std::sync::Mutex<HashMap<String, (u32, AbortHandle)>>,
}

impl TunnelRegistry {
    /// Loads the specs and reconciles them against the pid ledger, recovering
    /// tunnels whose ssh process outlived the previous supervisor.
    pub fn new(
        store: Arc<dyn SpecStore>,
        ledger: PidLedger,
        supervisor: ProcessSupervisor,
        opts: RegistryOptions,
    ) -> TunnelResult<Self> {
        let mut tunnels = Table::new();
        for spec in store.load_specs()? {
            if tunnels.contains_key(&spec.id) {
                warn!("duplicate tunnel id {}, keeping the first", spec.id);
                continue;
            }
            tunnels.insert(spec.id.clone(), Entry::new(spec));
        }
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let recovered = reconcile::reconcile_on_startup(&mut tunnels, &ledger);
        let registry = Self {
            inner: Arc::new(Inner {
                tunnels: RwLock::new(tunnels),
                store,
                ledger,
                ledger_lock: Mutex::new(()),
                config_lock: Mutex::new(()),
                supervisor,
                opts,
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                watchers: std::sync::Mutex::new(HashMap::new()),
            }),
        };
        for id in recovered {
            registry.emit(&id, TunnelStatus::Stopped, TunnelStatus::Running, None);
        }
        Ok(registry)
    }

    /// Hands out the receiving end of the event queue. Only the first caller
    /// gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<StatusChangeEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub async fn get(&self, id: &str) -> TunnelResult<Tunnel> {
        let tunnels = self.inner.tunnels.read().await;
        tunnels
            .get(id)
            .map(Entry::view)
            .ok_or_else(|| not_found(&tunnels, id))
    }

    /// Every tunnel, sorted by name.
    pub async fn list(&self) -> Vec<Tunnel> {
        let tunnels = self.inner.tunnels.read().await;
        tunnels
            .values()
            .map(Entry::view)
            .sorted_by(|a, b| a.spec.name.cmp(&b.spec.name).then(a.id().cmp(b.id())))
            .collect()
    }

    pub async fn list_by_profile(&self, profile: &str) -> Vec<Tunnel> {
        self.list()
            .await
            .into_iter()
            .filter(|t| t.spec.in_profile(profile))
            .collect()
    }

    pub async fn profiles(&self) -> Vec<String> {
        let tunnels = self.inner.tunnels.read().await;
        tunnels
            .values()
            .map(|e| {
                if e.spec.profile.is_empty() {
                    crate::tunnel::DEFAULT_PROFILE.to_string()
                } else {
                    e.spec.profile.clone()
                }
            })
            .sorted()
            .dedup()
            .collect()
    }

    /// (id, name) of tunnels matching `filter`, in name order.
    async fn select(&self, filter: impl Fn(&Entry) -> bool) -> Vec<(String, String)> {
        let tunnels = self.inner.tunnels.read().await;
        tunnels
            .values()
            .filter(|e| filter(e))
            .sorted_by(|a, b| a.spec.name.cmp(&b.spec.name))
            .map(|e| (e.spec.id.clone(), e.spec.name.clone()))
            .collect()
    }

    fn emit(&self, id: &str, old: TunnelStatus, new: TunnelStatus, error: Option<String>) {
        let event = StatusChangeEvent {
            id: id.to_string(),
            old_status: old,
            new_status: new,
            error,
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = self.inner.events_tx.try_send(event) {
            debug!(
                "event queue full, dropping {} {} -> {}",
                event.id, event.old_status, event.new_status
            );
        }
    }

    /// Rewrites the ledger from the running tunnels. Failures are logged: the
    /// ledger is a mirror, and a running process must not be disowned
    /// because the mirror could not be updated.
    async fn persist_ledger(&self) {
        let _guard = self.inner.ledger_lock.lock().await;
        let pids: PidMap = {
            let tunnels = self.inner.tunnels.read().await;
            tunnels
                .values()
                .filter(|e| e.state.status.is_running())
                .filter_map(|e| {
                    let pid = e.state.pid?;
                    let started = e.state.started_at.unwrap_or_else(chrono::Utc::now);
                    Some((e.spec.id.clone(), PidRecord::new(pid, started)))
                })
                .collect()
        };
        if let Err(err) = self.inner.ledger.save(&pids) {
            warn!("failed to update pid ledger: {err}");
        }
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<String, (u32, AbortHandle)>> {
        self.inner.watchers.lock().unwrap_or_else(|poisoned| {
            warn!("watcher table mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn not_found(tunnels: &Table, id: &str) -> TunnelError {
    TunnelError::NotFound {
        id: id.to_string(),
        suggestion: find_similar_tunnel(id, tunnels.keys().map(|k| k.as_str())),
    }
}
