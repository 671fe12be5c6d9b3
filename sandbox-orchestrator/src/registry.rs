//! In-memory index of live sandboxes for one backend.
//!
//! Holds `id -> entry` plus `tenant -> [id]` behind a single `RwLock`. Every
//! method takes the lock for the duration of a map operation only; callers
//! must never hold a guard across an `.await` (no guard escapes this module).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::labels;
use crate::types::{RegistrySummary, SandboxInfo, SandboxStatus};

struct Entry<X> {
    info: SandboxInfo,
    extra: X,
}

struct State<X> {
    sandboxes: HashMap<String, Entry<X>>,
    by_tenant: HashMap<String, Vec<String>>,
}

impl<X> State<X> {
    fn unlink_tenant(&mut self, tenant_id: &str, id: &str) {
        if let Some(ids) = self.by_tenant.get_mut(tenant_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_tenant.remove(tenant_id);
            }
        }
    }
}

/// Registry of live sandboxes. `X` carries backend-private per-sandbox state.
pub struct SandboxRegistry<X = ()> {
    state: RwLock<State<X>>,
}

impl<X> Default for SandboxRegistry<X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X> SandboxRegistry<X> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                sandboxes: HashMap::new(),
                by_tenant: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State<X>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<X>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace an entry, keeping the tenant index consistent.
    pub fn insert(&self, info: SandboxInfo, extra: X) {
        let mut state = self.write();
        let id = info.id.clone();
        let tenant = info.tenant_id.clone();
        if let Some(previous) = state.sandboxes.remove(&id) {
            let previous_tenant = previous.info.tenant_id;
            state.unlink_tenant(&previous_tenant, &id);
        }
        state.sandboxes.insert(id.clone(), Entry { info, extra });
        state.by_tenant.entry(tenant).or_default().push(id);
    }

    /// Remove an entry from both maps, returning it.
    pub fn remove(&self, id: &str) -> Option<(SandboxInfo, X)> {
        let mut state = self.write();
        let entry = state.sandboxes.remove(id)?;
        state.unlink_tenant(&entry.info.tenant_id, id);
        Some((entry.info, entry.extra))
    }

    /// Atomically replace the whole registry.
    pub fn replace_all(&self, entries: Vec<(SandboxInfo, X)>) {
        let mut sandboxes = HashMap::with_capacity(entries.len());
        let mut by_tenant: HashMap<String, Vec<String>> = HashMap::new();
        for (info, extra) in entries {
            if sandboxes.contains_key(&info.id) {
                continue;
            }
            by_tenant
                .entry(info.tenant_id.clone())
                .or_default()
                .push(info.id.clone());
            sandboxes.insert(info.id.clone(), Entry { info, extra });
        }
        let mut state = self.write();
        state.sandboxes = sandboxes;
        state.by_tenant = by_tenant;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().sandboxes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<SandboxInfo> {
        self.read().sandboxes.get(id).map(|entry| entry.info.clone())
    }

    /// Look up by exact ID, then by a unique ID prefix of at least 12
    /// characters (the engine's short ID length).
    pub fn find(&self, id: &str) -> Option<SandboxInfo> {
        let state = self.read();
        if let Some(entry) = state.sandboxes.get(id) {
            return Some(entry.info.clone());
        }
        if id.len() < 12 {
            return None;
        }
        let mut matches = state
            .sandboxes
            .iter()
            .filter(|(candidate, _)| candidate.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some((_, entry)), None) => Some(entry.info.clone()),
            _ => None,
        }
    }

    /// Look up by a backend-wide unique resource name, as computed by
    /// `resource_name`. Display names repeat across tenants and never match.
    pub fn find_by_resource<F>(&self, resource: &str, resource_name: F) -> Option<SandboxInfo>
    where
        F: Fn(&SandboxInfo) -> String,
    {
        self.read()
            .sandboxes
            .values()
            .find(|entry| resource_name(&entry.info) == resource)
            .map(|entry| entry.info.clone())
    }

    /// Look up within one tenant by ID or sandbox name.
    pub fn find_for_tenant(&self, tenant_id: &str, id_or_name: &str) -> Option<SandboxInfo> {
        let state = self.read();
        state
            .by_tenant
            .get(tenant_id)?
            .iter()
            .filter_map(|id| state.sandboxes.get(id))
            .find(|entry| entry.info.id == id_or_name || entry.info.name == id_or_name)
            .map(|entry| entry.info.clone())
    }

    pub fn list_tenant(&self, tenant_id: &str) -> Vec<SandboxInfo> {
        let state = self.read();
        state
            .by_tenant
            .get(tenant_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.sandboxes.get(id))
                    .map(|entry| entry.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<SandboxInfo> {
        self.read()
            .sandboxes
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn count_tenant(&self, tenant_id: &str) -> usize {
        self.read()
            .by_tenant
            .get(tenant_id)
            .map_or(0, |ids| ids.len())
    }

    /// Apply `f` to the entry under the write lock. Returns false if absent.
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SandboxInfo, &mut X),
    {
        let mut state = self.write();
        match state.sandboxes.get_mut(id) {
            Some(entry) => {
                f(&mut entry.info, &mut entry.extra);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, id: &str, status: SandboxStatus) -> bool {
        self.update(id, |info, _| info.status = status)
    }

    pub fn touch(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.update(id, |info, _| info.last_used_at = now)
    }

    pub fn idle_time(&self, id: &str, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.read()
            .sandboxes
            .get(id)
            .map(|entry| now - entry.info.last_used_at)
    }

    /// Running guest sandboxes idle for longer than `threshold`.
    pub fn idle(&self, threshold: ChronoDuration, now: DateTime<Utc>) -> Vec<SandboxInfo> {
        self.read()
            .sandboxes
            .values()
            .map(|entry| &entry.info)
            .filter(|info| info.status == SandboxStatus::Running)
            .filter(|info| now - info.last_used_at > threshold)
            .filter(|info| labels::is_guest(&info.labels))
            .cloned()
            .collect()
    }

    /// Sandboxes whose hard session cap has elapsed. Entries still being
    /// created are left to their creator.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<SandboxInfo> {
        self.read()
            .sandboxes
            .values()
            .map(|entry| &entry.info)
            .filter(|info| {
                !matches!(
                    info.status,
                    SandboxStatus::Creating | SandboxStatus::Configuring
                )
            })
            .filter(|info| labels::is_expired(info, now))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> RegistrySummary {
        let state = self.read();
        let mut summary = RegistrySummary {
            total: state.sandboxes.len(),
            ..Default::default()
        };
        for entry in state.sandboxes.values() {
            *summary
                .by_tenant
                .entry(entry.info.tenant_id.clone())
                .or_default() += 1;
            *summary.by_image.entry(entry.info.image.clone()).or_default() += 1;
            match entry.info.status {
                SandboxStatus::Running => summary.running += 1,
                SandboxStatus::Stopped => summary.stopped += 1,
                _ => summary.other += 1,
            }
        }
        summary
    }
}

impl<X: Clone> SandboxRegistry<X> {
    /// Entry together with its backend-private state.
    pub fn get_with(&self, id: &str) -> Option<(SandboxInfo, X)> {
        self.read()
            .sandboxes
            .get(id)
            .map(|entry| (entry.info.clone(), entry.extra.clone()))
    }

    /// Snapshot of every entry with its backend extra.
    pub fn entries(&self) -> Vec<(SandboxInfo, X)> {
        self.read()
            .sandboxes
            .values()
            .map(|entry| (entry.info.clone(), entry.extra.clone()))
            .collect()
    }
}

#[cfg(test)]
impl<X> SandboxRegistry<X> {
    /// Both maps reference exactly the same IDs.
    pub(crate) fn assert_consistent(&self) {
        let state = self.read();
        let mut indexed = 0;
        for (tenant, ids) in &state.by_tenant {
            assert!(!ids.is_empty(), "empty index bucket for {tenant}");
            for id in ids {
                let entry = state
                    .sandboxes
                    .get(id)
                    .unwrap_or_else(|| panic!("index references missing {id}"));
                assert_eq!(&entry.info.tenant_id, tenant);
                indexed += 1;
            }
        }
        assert_eq!(indexed, state.sandboxes.len());
    }
}
