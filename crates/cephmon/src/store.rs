//! Durable directory of clusters, servers, services and pools.
//!
//! Each refresh pass works on a [`ClusterTxn`], a private copy of one
//! cluster's records. Nothing it does is visible until [`ClusterStore::commit`];
//! dropping the transaction discards the pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::model::{
    Cluster, ClusterId, ClusterSnapshot, PoolRecord, RefreshAttempt, ServerRecord, ServerView,
    ServiceKind, ServiceStatusRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(ClusterId),
    #[error("Cluster already registered: {0}")]
    DuplicateCluster(String),
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Counts of record mutations made through a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeLog {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl ChangeLog {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecords {
    pub servers: BTreeMap<String, ServerRecord>,
    pub services: BTreeMap<u64, ServiceStatusRecord>,
    pub pools: BTreeMap<i64, PoolRecord>,
    #[serde(default)]
    pub next_service_id: u64,
}

pub struct ClusterTxn {
    cluster_id: ClusterId,
    records: ClusterRecords,
    changes: ChangeLog,
    snapshot: Option<(ClusterSnapshot, DateTime<Utc>)>,
}

impl ClusterTxn {
    pub fn new(cluster_id: ClusterId, records: ClusterRecords) -> Self {
        Self {
            cluster_id,
            records,
            changes: ChangeLog::default(),
            snapshot: None,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn records(&self) -> &ClusterRecords {
        &self.records
    }

    pub fn changes(&self) -> ChangeLog {
        self.changes
    }

    pub fn service_ids(&self) -> BTreeSet<u64> {
        self.records.services.keys().copied().collect()
    }

    pub fn server_addrs(&self) -> BTreeSet<String> {
        self.records.servers.keys().cloned().collect()
    }

    pub fn server(&self, addr: &str) -> Option<&ServerRecord> {
        self.records.servers.get(addr)
    }

    /// Returns true if the server was created.
    pub fn get_or_create_server(&mut self, addr: &str) -> bool {
        if self.records.servers.contains_key(addr) {
            return false;
        }
        self.records
            .servers
            .insert(addr.to_string(), ServerRecord::new(addr.to_string()));
        self.changes.created += 1;
        true
    }

    pub fn update_server(&mut self, server: ServerRecord) {
        match self.records.servers.get_mut(&server.addr) {
            Some(existing) if *existing == server => {}
            Some(existing) => {
                *existing = server;
                self.changes.updated += 1;
            }
            None => {
                self.records.servers.insert(server.addr.clone(), server);
                self.changes.created += 1;
            }
        }
    }

    /// Looks up the service by (server, kind, service id), creating it with
    /// `name` if absent. Returns the record id and whether it was created.
    pub fn get_or_create_service(
        &mut self,
        server_addr: &str,
        kind: ServiceKind,
        service_id: i64,
        name: &str,
    ) -> (u64, bool) {
        let existing = self.records.services.values().find(|s| {
            s.server_addr == server_addr && s.kind == kind && s.service_id == service_id
        });
        if let Some(service) = existing {
            return (service.id, false);
        }

        let id = self.records.next_service_id;
        self.records.next_service_id += 1;
        self.records.services.insert(
            id,
            ServiceStatusRecord {
                id,
                server_addr: server_addr.to_string(),
                kind,
                service_id,
                name: name.to_string(),
            },
        );
        self.changes.created += 1;
        (id, true)
    }

    pub fn services_of(&self, kind: ServiceKind, service_id: i64) -> Vec<&ServiceStatusRecord> {
        self.records
            .services
            .values()
            .filter(|s| s.kind == kind && s.service_id == service_id)
            .collect()
    }

    pub fn delete_services_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&ServiceStatusRecord) -> bool,
    {
        let before = self.records.services.len();
        self.records.services.retain(|_, s| !pred(s));
        let removed = before - self.records.services.len();
        self.changes.deleted += removed as u64;
        removed
    }

    pub fn delete_services(&mut self, ids: &BTreeSet<u64>) -> usize {
        self.delete_services_where(|s| ids.contains(&s.id))
    }

    /// Deletes servers and every service still attached to them.
    pub fn delete_servers(&mut self, addrs: &BTreeSet<String>) -> usize {
        self.delete_services_where(|s| addrs.contains(&s.server_addr));
        let before = self.records.servers.len();
        self.records.servers.retain(|addr, _| !addrs.contains(addr));
        let removed = before - self.records.servers.len();
        self.changes.deleted += removed as u64;
        removed
    }

    pub fn retain_pools<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&PoolRecord) -> bool,
    {
        let before = self.records.pools.len();
        self.records.pools.retain(|_, p| keep(p));
        let removed = before - self.records.pools.len();
        self.changes.deleted += removed as u64;
        removed
    }

    /// Returns true if the pool was created.
    pub fn upsert_pool(&mut self, pool: PoolRecord) -> bool {
        match self.records.pools.get_mut(&pool.pool_id) {
            Some(existing) => {
                if *existing != pool {
                    *existing = pool;
                    self.changes.updated += 1;
                }
                false
            }
            None => {
                self.records.pools.insert(pool.pool_id, pool);
                self.changes.created += 1;
                true
            }
        }
    }

    pub fn pools(&self) -> Vec<PoolRecord> {
        self.records.pools.values().cloned().collect()
    }

    /// Attaches the snapshot to be written with the records on commit.
    pub fn set_snapshot(&mut self, snapshot: ClusterSnapshot, at: DateTime<Utc>) {
        self.snapshot = Some((snapshot, at));
    }
}

pub trait ClusterStore: Send + Sync {
    fn clusters(&self) -> Result<Vec<Cluster>, StoreError>;
    fn cluster(&self, id: ClusterId) -> Result<Cluster, StoreError>;
    fn add_cluster(&self, name: &str, api_base_url: &str) -> Result<Cluster, StoreError>;
    fn remove_cluster(&self, id: ClusterId) -> Result<(), StoreError>;
    fn begin(&self, id: ClusterId) -> Result<ClusterTxn, StoreError>;
    fn commit(&self, txn: ClusterTxn) -> Result<(), StoreError>;
    fn record_attempt(&self, id: ClusterId, attempt: &RefreshAttempt) -> Result<(), StoreError>;
    fn servers(&self, id: ClusterId) -> Result<Vec<ServerView>, StoreError>;
    fn pools(&self, id: ClusterId) -> Result<Vec<PoolRecord>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterEntry {
    cluster: Cluster,
    records: ClusterRecords,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_cluster_id: ClusterId,
    clusters: BTreeMap<ClusterId, ClusterEntry>,
}

impl StoreState {
    fn entry(&self, id: ClusterId) -> Result<&ClusterEntry, StoreError> {
        self.clusters.get(&id).ok_or(StoreError::ClusterNotFound(id))
    }

    fn entry_mut(&mut self, id: ClusterId) -> Result<&mut ClusterEntry, StoreError> {
        self.clusters
            .get_mut(&id)
            .ok_or(StoreError::ClusterNotFound(id))
    }

    fn clusters(&self) -> Vec<Cluster> {
        self.clusters.values().map(|e| e.cluster.clone()).collect()
    }

    fn add_cluster(&mut self, name: &str, api_base_url: &str) -> Result<Cluster, StoreError> {
        if self.clusters.values().any(|e| e.cluster.name == name) {
            return Err(StoreError::DuplicateCluster(name.to_string()));
        }
        self.next_cluster_id += 1;
        let cluster = Cluster::new(self.next_cluster_id, name.to_string(), api_base_url.to_string());
        self.clusters.insert(
            cluster.id,
            ClusterEntry {
                cluster: cluster.clone(),
                records: ClusterRecords::default(),
            },
        );
        Ok(cluster)
    }

    fn remove_cluster(&mut self, id: ClusterId) -> Result<(), StoreError> {
        self.clusters
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::ClusterNotFound(id))
    }

    fn begin(&self, id: ClusterId) -> Result<ClusterTxn, StoreError> {
        Ok(ClusterTxn::new(id, self.entry(id)?.records.clone()))
    }

    fn commit(&mut self, txn: ClusterTxn) -> Result<(), StoreError> {
        let entry = self.entry_mut(txn.cluster_id)?;
        entry.records = txn.records;
        if let Some((snapshot, at)) = txn.snapshot {
            entry.cluster.snapshot = Some(snapshot);
            entry.cluster.update_time = Some(at);
        }
        Ok(())
    }

    fn record_attempt(&mut self, id: ClusterId, attempt: &RefreshAttempt) -> Result<(), StoreError> {
        let cluster = &mut self.entry_mut(id)?.cluster;
        cluster.update_attempt_time = Some(attempt.at);
        match &attempt.error {
            Some(error) => {
                cluster.update_error_msg = Some(error.message.clone());
                cluster.update_error_isclient = error.is_client;
            }
            None => {
                cluster.update_error_msg = None;
                cluster.update_error_isclient = false;
            }
        }
        Ok(())
    }

    fn servers(&self, id: ClusterId) -> Result<Vec<ServerView>, StoreError> {
        let records = &self.entry(id)?.records;
        Ok(records
            .servers
            .values()
            .map(|server| ServerView {
                server: server.clone(),
                services: records
                    .services
                    .values()
                    .filter(|s| s.server_addr == server.addr)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    fn pools(&self, id: ClusterId) -> Result<Vec<PoolRecord>, StoreError> {
        Ok(self.entry(id)?.records.pools.values().cloned().collect())
    }
}

fn lock(state: &Mutex<StoreState>) -> Result<MutexGuard<'_, StoreState>, StoreError> {
    state.lock().map_err(|_| StoreError::Poisoned)
}

/// In-process store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterStore for MemoryStore {
    fn clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        Ok(lock(&self.state)?.clusters())
    }

    fn cluster(&self, id: ClusterId) -> Result<Cluster, StoreError> {
        Ok(lock(&self.state)?.entry(id)?.cluster.clone())
    }

    fn add_cluster(&self, name: &str, api_base_url: &str) -> Result<Cluster, StoreError> {
        lock(&self.state)?.add_cluster(name, api_base_url)
    }

    fn remove_cluster(&self, id: ClusterId) -> Result<(), StoreError> {
        lock(&self.state)?.remove_cluster(id)
    }

    fn begin(&self, id: ClusterId) -> Result<ClusterTxn, StoreError> {
        lock(&self.state)?.begin(id)
    }

    fn commit(&self, txn: ClusterTxn) -> Result<(), StoreError> {
        lock(&self.state)?.commit(txn)
    }

    fn record_attempt(&self, id: ClusterId, attempt: &RefreshAttempt) -> Result<(), StoreError> {
        lock(&self.state)?.record_attempt(id, attempt)
    }

    fn servers(&self, id: ClusterId) -> Result<Vec<ServerView>, StoreError> {
        lock(&self.state)?.servers(id)
    }

    fn pools(&self, id: ClusterId) -> Result<Vec<PoolRecord>, StoreError> {
        lock(&self.state)?.pools(id)
    }
}

/// Store persisted as a single JSON document, rewritten after every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<T, StoreError>,
    {
        let mut state = lock(&self.state)?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ClusterStore for JsonFileStore {
    fn clusters(&self) -> Result<Vec<Cluster>, StoreError> {
        Ok(lock(&self.state)?.clusters())
    }

    fn cluster(&self, id: ClusterId) -> Result<Cluster, StoreError> {
        Ok(lock(&self.state)?.entry(id)?.cluster.clone())
    }

    fn add_cluster(&self, name: &str, api_base_url: &str) -> Result<Cluster, StoreError> {
        self.mutate(|s| s.add_cluster(name, api_base_url))
    }

    fn remove_cluster(&self, id: ClusterId) -> Result<(), StoreError> {
        self.mutate(|s| s.remove_cluster(id))
    }

    fn begin(&self, id: ClusterId) -> Result<ClusterTxn, StoreError> {
        lock(&self.state)?.begin(id)
    }

    fn commit(&self, txn: ClusterTxn) -> Result<(), StoreError> {
        self.mutate(|s| s.commit(txn))
    }

    fn record_attempt(&self, id: ClusterId, attempt: &RefreshAttempt) -> Result<(), StoreError> {
        self.mutate(|s| s.record_attempt(id, attempt))
    }

    fn servers(&self, id: ClusterId) -> Result<Vec<ServerView>, StoreError> {
        lock(&self.state)?.servers(id)
    }

    fn pools(&self, id: ClusterId) -> Result<Vec<PoolRecord>, StoreError> {
        lock(&self.state)?.pools(id)
    }
}
