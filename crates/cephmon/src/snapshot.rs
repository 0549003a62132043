//! One refresh pass: reconcile the registry, then populate every snapshot
//! section in a fixed order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::classify;
use crate::model::{ClusterSnapshot, Counters, HealthReport, OsdId, OsdRecord, PgRecord, PoolRecord, SpaceStats};
use crate::net::NetworkProbe;
use crate::registry::{RegistryError, ServiceRegistry};
use crate::store::ClusterTxn;
use crate::telemetry::{OsdInfo, PgBrief, TelemetryError, TelemetrySource};
use crate::topology::{CrushTypes, TopologyError};

const KIB: u64 = 1024;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("Malformed CRUSH tree: {0}")]
    Topology(#[from] TopologyError),
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl RefreshError {
    /// True when the pass failed talking to the cluster's REST API.
    pub fn is_client(&self) -> bool {
        matches!(self, RefreshError::Telemetry(e) if e.is_client())
    }
}

impl From<RegistryError> for RefreshError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Telemetry(e) => RefreshError::Telemetry(e),
            RegistryError::Topology(e) => RefreshError::Topology(e),
        }
    }
}

/// Snapshot sections, populated in this order after registry reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateStep {
    Space,
    Health,
    Pools,
    OsdsAndPgs,
    Counters,
}

pub const PIPELINE: [PopulateStep; 5] = [
    PopulateStep::Space,
    PopulateStep::Health,
    PopulateStep::Pools,
    PopulateStep::OsdsAndPgs,
    PopulateStep::Counters,
];

impl PopulateStep {
    pub fn name(&self) -> &'static str {
        match self {
            PopulateStep::Space => "space",
            PopulateStep::Health => "health",
            PopulateStep::Pools => "pools",
            PopulateStep::OsdsAndPgs => "osds_and_pgs",
            PopulateStep::Counters => "counters",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub crush_types: CrushTypes,
    /// Read PGs from the full `pg dump` rather than the brief listing.
    pub full_pg_dump: bool,
}

pub struct SnapshotBuilder<'a> {
    source: &'a dyn TelemetrySource,
    net: &'a dyn NetworkProbe,
    options: &'a BuildOptions,
}

struct PassState {
    snapshot: ClusterSnapshot,
    osd_servers: HashMap<String, String>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        source: &'a dyn TelemetrySource,
        net: &'a dyn NetworkProbe,
        options: &'a BuildOptions,
    ) -> Self {
        Self {
            source,
            net,
            options,
        }
    }

    pub async fn build(&self, txn: &mut ClusterTxn) -> Result<ClusterSnapshot, RefreshError> {
        let mon_status = self.source.mon_status().await?;
        let osd_map = self.source.osd_map().await?;

        let mut registry = ServiceRegistry::new(self.source, self.net, &self.options.crush_types);
        let outcome = registry
            .reconcile(txn, &osd_map.osds, &mon_status.monmap.mons)
            .await?;

        let mut state = PassState {
            snapshot: ClusterSnapshot::default(),
            osd_servers: outcome.osd_servers,
        };
        for step in PIPELINE {
            tracing::debug!(cluster = txn.cluster_id(), step = step.name(), "populating");
            self.run_step(step, txn, &mut state).await?;
        }
        Ok(state.snapshot)
    }

    async fn run_step(
        &self,
        step: PopulateStep,
        txn: &mut ClusterTxn,
        state: &mut PassState,
    ) -> Result<(), RefreshError> {
        match step {
            PopulateStep::Space => {
                state.snapshot.space = self.space().await?;
            }
            PopulateStep::Health => {
                state.snapshot.health = self.health().await?;
            }
            PopulateStep::Pools => {
                state.snapshot.pools = self.pools(txn).await?;
            }
            PopulateStep::OsdsAndPgs => {
                self.osds_and_pgs(txn, state).await?;
            }
            PopulateStep::Counters => {
                state.snapshot.counters = self.counters().await?;
            }
        }
        Ok(())
    }

    async fn space(&self) -> Result<SpaceStats, RefreshError> {
        let df = self.source.space_stats().await?;
        Ok(SpaceStats {
            used_bytes: df.stats.total_used.saturating_mul(KIB),
            capacity_bytes: df.stats.total_space.saturating_mul(KIB),
            free_bytes: df.stats.total_avail.saturating_mul(KIB),
        })
    }

    async fn health(&self) -> Result<HealthReport, RefreshError> {
        let health = self.source.health().await?;
        Ok(HealthReport {
            overall_status: health.overall_status,
            summary: health.summary,
            detail: health.detail,
        })
    }

    /// Pools absent from the OSD map are deleted; pools with no `df` stats
    /// are left as they were.
    async fn pools(&self, txn: &mut ClusterTxn) -> Result<Vec<PoolRecord>, RefreshError> {
        let osd_map = self.source.osd_map().await?;
        let df = self.source.space_stats().await?;

        let live: BTreeSet<i64> = osd_map.pools.iter().map(|p| p.pool).collect();
        let removed = txn.retain_pools(|p| live.contains(&p.pool_id));
        if removed > 0 {
            tracing::info!(cluster = txn.cluster_id(), removed, "deleted pools no longer in OSD map");
        }

        for pool in &osd_map.pools {
            let Some(stats) = df.pools.iter().find(|s| s.id == pool.pool).map(|s| &s.stats) else {
                tracing::debug!(pool = pool.pool, "no df stats for pool, skipping");
                continue;
            };
            txn.upsert_pool(PoolRecord {
                pool_id: pool.pool,
                name: pool.pool_name.clone(),
                quota_max_bytes: pool.quota_max_bytes,
                quota_max_objects: pool.quota_max_objects,
                used_bytes: stats.bytes_used,
                used_objects: stats.objects,
            });
        }

        Ok(txn.pools())
    }

    async fn pg_rows(&self) -> Result<Vec<PgBrief>, RefreshError> {
        if self.options.full_pg_dump {
            Ok(self.source.pg_dump().await?.pg_stats)
        } else {
            Ok(self.source.pg_brief().await?)
        }
    }

    async fn osds_and_pgs(&self, txn: &ClusterTxn, state: &mut PassState) -> Result<(), RefreshError> {
        let pgs: Vec<PgRecord> = self
            .pg_rows()
            .await?
            .into_iter()
            .map(|pg| PgRecord {
                pgid: pg.pgid,
                acting: pg.acting,
                up: pg.up,
                state: pg.state.split('+').map(str::to_string).collect(),
            })
            .collect();

        let pool_names: HashMap<i64, String> = self
            .source
            .pools()
            .await?
            .into_iter()
            .map(|p| (p.poolnum, p.poolname))
            .collect();

        let index = PgIndex::build(&pgs, &pool_names);

        let osd_map = self.source.osd_map().await?;
        let osds = osd_map
            .osds
            .iter()
            .map(|osd| {
                let host = state
                    .osd_servers
                    .get(&osd.service_name())
                    .and_then(|addr| txn.server(addr))
                    .map(|server| server.display_host().to_string());
                index.osd_record(osd, host)
            })
            .collect();

        state.snapshot.pgs = pgs;
        state.snapshot.osds = osds;
        state.snapshot.osds_by_pg_state = index.osds_by_pg_state;
        Ok(())
    }

    async fn counters(&self) -> Result<Counters, RefreshError> {
        let status = self.source.status().await?;
        let osd_map = self.source.osd_map().await?;
        let pool_stats = self.source.pool_pg_stats().await?;

        Ok(Counters {
            pool: classify::pool_counters(&pool_stats),
            osd: classify::osd_counters(&osd_map.osds),
            mds: classify::mds_counters(&status.mdsmap),
            mon: classify::mon_counters(&status.monmap.mons, &status.quorum, self.net).await,
            pg: classify::pg_counters(&status.pgmap.pgs_by_state),
        })
    }
}

/// Per-OSD views of the PG list.
#[derive(Debug, Default)]
pub struct PgIndex {
    pub pg_states_by_osd: HashMap<OsdId, BTreeMap<String, u64>>,
    pub pg_count_by_osd: HashMap<OsdId, u64>,
    pub pools_by_osd: HashMap<OsdId, BTreeSet<String>>,
    pub osds_by_pg_state: BTreeMap<String, BTreeSet<OsdId>>,
}

impl PgIndex {
    /// PGs naming a pool id not in `pool_names` still count toward states
    /// and totals; only the pool attribution is skipped.
    pub fn build(pgs: &[PgRecord], pool_names: &HashMap<i64, String>) -> Self {
        let mut index = Self::default();
        for pg in pgs {
            let acting: BTreeSet<OsdId> = pg.acting.iter().copied().collect();
            let pool_name = pg.pool_id().and_then(|id| pool_names.get(&id));

            for osd in &acting {
                *index.pg_count_by_osd.entry(*osd).or_insert(0) += 1;
            }
            for label in &pg.state {
                index
                    .osds_by_pg_state
                    .entry(label.clone())
                    .or_default()
                    .extend(acting.iter().copied());
                for osd in &acting {
                    *index
                        .pg_states_by_osd
                        .entry(*osd)
                        .or_default()
                        .entry(label.clone())
                        .or_insert(0) += 1;
                    if let Some(name) = pool_name {
                        index.pools_by_osd.entry(*osd).or_default().insert(name.clone());
                    }
                }
            }
        }
        index
    }

    pub fn osd_record(&self, osd: &OsdInfo, host: Option<String>) -> OsdRecord {
        OsdRecord {
            id: osd.osd,
            uuid: osd.uuid.clone(),
            up: osd.up,
            in_: osd.in_,
            up_from: osd.up_from,
            public_addr: osd.public_addr.clone(),
            cluster_addr: osd.cluster_addr.clone(),
            heartbeat_back_addr: osd.heartbeat_back_addr.clone(),
            heartbeat_front_addr: osd.heartbeat_front_addr.clone(),
            host,
            pg_states: self.pg_states_by_osd.get(&osd.osd).cloned().unwrap_or_default(),
            pg_count: self.pg_count_by_osd.get(&osd.osd).copied().unwrap_or(0),
            pools: self.pools_by_osd.get(&osd.osd).cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(pgid: &str, acting: &[OsdId], state: &str) -> PgRecord {
        PgRecord {
            pgid: pgid.to_string(),
            acting: acting.to_vec(),
            up: acting.to_vec(),
            state: state.split('+').map(str::to_string).collect(),
        }
    }

    #[test]
    fn test_pipeline_order() {
        let names: Vec<&str> = PIPELINE.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["space", "health", "pools", "osds_and_pgs", "counters"]);
    }

    #[test]
    fn test_pg_index_counts_and_states() {
        let mut pools = HashMap::new();
        pools.insert(1, "rbd".to_string());
        let pgs = vec![
            pg("1.0", &[0, 1], "active+clean"),
            pg("1.1", &[1, 2], "active+degraded"),
        ];
        let index = PgIndex::build(&pgs, &pools);

        assert_eq!(index.pg_count_by_osd.get(&1), Some(&2));
        assert_eq!(index.pg_count_by_osd.get(&0), Some(&1));
        assert_eq!(index.pg_states_by_osd[&1].get("active"), Some(&2));
        assert_eq!(index.pg_states_by_osd[&2].get("degraded"), Some(&1));
        let degraded: Vec<OsdId> = index.osds_by_pg_state["degraded"].iter().copied().collect();
        assert_eq!(degraded, vec![1, 2]);
        assert!(index.pools_by_osd[&0].contains("rbd"));
    }

    #[test]
    fn test_pg_index_unknown_pool_tolerated() {
        let pgs = vec![pg("9.0", &[3], "active+clean")];
        let index = PgIndex::build(&pgs, &HashMap::new());
        assert_eq!(index.pg_count_by_osd.get(&3), Some(&1));
        assert!(index.pools_by_osd.get(&3).is_none());
    }

    #[test]
    fn test_pg_index_duplicate_acting_counted_once() {
        let pgs = vec![pg("1.0", &[4, 4], "active")];
        let index = PgIndex::build(&pgs, &HashMap::new());
        assert_eq!(index.pg_count_by_osd.get(&4), Some(&1));
    }

    #[test]
    fn test_refresh_error_client_flag() {
        let client = RefreshError::Telemetry(TelemetryError::Status {
            url: "http://x/df".to_string(),
            status: 503,
        });
        let topo = RefreshError::Topology(TopologyError::DuplicateId(1));
        assert!(client.is_client());
        assert!(!topo.is_client());
    }
}
