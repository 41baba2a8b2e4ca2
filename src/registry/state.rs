//! Configuration mutations. Each one rewrites the whole spec store.
//!
//! `config_lock` serializes them; the table lock is only held to check and
//! mutate entries, never while the store is being written.

use super::{Entry, TunnelRegistry, not_found};
use crate::error::{TunnelError, TunnelResult};
use crate::tunnel::TunnelSpec;
use crate::tunnel_status::Tunnel;

impl TunnelRegistry {
    pub async fn add(&self, spec: TunnelSpec) -> TunnelResult<Tunnel> {
        spec.validate()?;
        let _guard = self.inner.config_lock.lock().await;
        let mut specs = {
            let tunnels = self.inner.tunnels.read().await;
            if tunnels.contains_key(&spec.id) {
                return Err(TunnelError::validation(
                    &spec.id,
                    "a tunnel with this id already exists",
                ));
            }
            tunnels.values().map(|e| e.spec.clone()).collect::<Vec<_>>()
        };
        specs.push(spec.clone());
        self.save(&specs)?;

        // ids only appear through config mutations, which config_lock serializes
        let id = spec.id.clone();
        let entry = Entry::new(spec);
        let view = entry.view();
        self.inner.tunnels.write().await.insert(id.clone(), entry);
        info!("added tunnel {id}");
        Ok(view)
    }

    /// Replaces the spec of a stopped tunnel. Runtime state is kept.
    pub async fn update(&self, spec: TunnelSpec) -> TunnelResult<Tunnel> {
        spec.validate()?;
        let _guard = self.inner.config_lock.lock().await;
        let id = spec.id.clone();
        let (previous, specs, view) = {
            let mut tunnels = self.inner.tunnels.write().await;
            let Some(entry) = tunnels.get_mut(&id) else {
                return Err(not_found(&tunnels, &id));
            };
            if entry.state.status.is_active() {
                return Err(TunnelError::Busy { id });
            }
            let previous = std::mem::replace(&mut entry.spec, spec);
            let view = entry.view();
            let specs: Vec<TunnelSpec> = tunnels.values().map(|e| e.spec.clone()).collect();
            (previous, specs, view)
        };
        if let Err(err) = self.save(&specs) {
            let mut tunnels = self.inner.tunnels.write().await;
            match tunnels.get_mut(&id) {
                Some(entry) if !entry.state.status.is_active() => entry.spec = previous,
                Some(_) => warn!("tunnel {id} started during a failed update, keeping its new spec"),
                None => {}
            }
            return Err(err);
        }
        info!("updated tunnel {id}");
        Ok(view)
    }

    pub async fn remove(&self, id: &str) -> TunnelResult<()> {
        let _guard = self.inner.config_lock.lock().await;
        // taken out of the table up front so nothing can start it meanwhile
        let (index, key, entry, specs) = {
            let mut tunnels = self.inner.tunnels.write().await;
            match tunnels.get(id) {
                None => return Err(not_found(&tunnels, id)),
                Some(entry) if entry.state.status.is_active() => {
                    return Err(TunnelError::Busy { id: id.to_string() });
                }
                Some(_) => {}
            }
            let Some((index, key, entry)) = tunnels.shift_remove_full(id) else {
                return Err(not_found(&tunnels, id));
            };
            let specs: Vec<TunnelSpec> = tunnels.values().map(|e| e.spec.clone()).collect();
            (index, key, entry, specs)
        };
        if let Err(err) = self.save(&specs) {
            let mut tunnels = self.inner.tunnels.write().await;
            let index = index.min(tunnels.len());
            tunnels.shift_insert(index, key, entry);
            return Err(err);
        }
        info!("removed tunnel {id}");
        Ok(())
    }

    /// Adds every spec whose id is not taken yet, in one write. Returns the
    /// ids that were added.
    pub async fn import(&self, specs: Vec<TunnelSpec>) -> TunnelResult<Vec<String>> {
        for spec in &specs {
            spec.validate()?;
        }
        let _guard = self.inner.config_lock.lock().await;
        let (mut all, new) = {
            let tunnels = self.inner.tunnels.read().await;
            let all: Vec<TunnelSpec> = tunnels.values().map(|e| e.spec.clone()).collect();
            let mut new: Vec<TunnelSpec> = vec![];
            for spec in specs {
                if tunnels.contains_key(&spec.id) || new.iter().any(|s| s.id == spec.id) {
                    debug!("skipping existing tunnel {}", spec.id);
                    continue;
                }
                new.push(spec);
            }
            (all, new)
        };
        if new.is_empty() {
            return Ok(vec![]);
        }
        all.extend(new.iter().cloned());
        self.save(&all)?;

        let added: Vec<String> = new.iter().map(|s| s.id.clone()).collect();
        let mut tunnels = self.inner.tunnels.write().await;
        for spec in new {
            tunnels.insert(spec.id.clone(), Entry::new(spec));
        }
        info!("imported {} tunnel(s)", added.len());
        Ok(added)
    }

    /// Configured specs in table order.
    pub async fn specs(&self) -> Vec<TunnelSpec> {
        let tunnels = self.inner.tunnels.read().await;
        tunnels.values().map(|e| e.spec.clone()).collect()
    }

    fn save(&self, specs: &[TunnelSpec]) -> TunnelResult<()> {
        self.inner.store.save_specs(specs).map_err(|err| {
            error!("failed to save tunnel configuration: {err}");
            TunnelError::from(err)
        })
    }
}
