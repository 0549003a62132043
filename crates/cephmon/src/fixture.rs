//! Captured-document telemetry and canned network answers.
//!
//! Used by the test suites and by `cephmon replay`, which builds a snapshot
//! from a directory of saved REST API responses without touching a cluster.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::net::NetworkProbe;
use crate::telemetry::{
    decode, DfDoc, HealthDoc, MonStatusDoc, OsdMapDoc, OsdTreeDoc, PgBrief, PgDumpDoc, PoolName,
    PoolPgStat, StatusDoc, TelemetryError, TelemetrySource,
};

/// Capture file names, keyed by REST endpoint.
pub const CAPTURE_FILES: [(&str, &str); 10] = [
    ("status", "status.json"),
    ("df", "df.json"),
    ("health?detail", "health.json"),
    ("osd/dump", "osd_dump.json"),
    ("mon_status", "mon_status.json"),
    ("pg/dump?dumpcontents=pools", "pg_dump_pools.json"),
    ("osd/lspools", "osd_lspools.json"),
    ("pg/dump", "pg_dump.json"),
    ("pg/dump?dumpcontents=pgs_brief", "pg_dump_pgs_brief.json"),
    ("osd/tree", "osd_tree.json"),
];

#[derive(Debug, Default)]
pub struct StaticSource {
    docs: HashMap<&'static str, serde_json::Value>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every capture file present in `dir`. Files may hold either the
    /// bare document or the REST API's `{"output": ...}` envelope.
    pub fn from_dir(dir: &Path) -> Result<Self, anyhow::Error> {
        let mut source = Self::new();
        for (endpoint, file) in CAPTURE_FILES {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let mut value: serde_json::Value = serde_json::from_str(&contents)?;
            if let Some(output) = value.get_mut("output") {
                value = output.take();
            }
            source.docs.insert(endpoint, value);
        }
        Ok(source)
    }

    pub fn with_doc(mut self, endpoint: &'static str, value: serde_json::Value) -> Self {
        self.docs.insert(endpoint, value);
        self
    }

    pub fn with_osd_tree(self, doc: OsdTreeDoc) -> Self {
        let value = serde_json::to_value(&doc).unwrap_or(serde_json::Value::Null);
        self.with_doc("osd/tree", value)
    }

    pub fn doc(&self, endpoint: &str) -> Option<&serde_json::Value> {
        self.docs.get(endpoint)
    }

    /// Number of times an endpoint was requested.
    pub fn fetches(&self, endpoint: &str) -> usize {
        self.fetches
            .lock()
            .map(|f| f.get(endpoint).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn fetch<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T, TelemetryError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            *fetches.entry(endpoint.to_string()).or_insert(0) += 1;
        }
        let value = self.docs.get(endpoint).cloned().ok_or_else(|| TelemetryError::Http {
            url: format!("static://{}", endpoint),
            msg: "no capture for endpoint".to_string(),
        })?;
        decode(endpoint, value)
    }
}

#[async_trait]
impl TelemetrySource for StaticSource {
    async fn status(&self) -> Result<StatusDoc, TelemetryError> {
        self.fetch("status")
    }

    async fn space_stats(&self) -> Result<DfDoc, TelemetryError> {
        self.fetch("df")
    }

    async fn health(&self) -> Result<HealthDoc, TelemetryError> {
        self.fetch("health?detail")
    }

    async fn osd_map(&self) -> Result<OsdMapDoc, TelemetryError> {
        self.fetch("osd/dump")
    }

    async fn mon_status(&self) -> Result<MonStatusDoc, TelemetryError> {
        self.fetch("mon_status")
    }

    async fn pool_pg_stats(&self) -> Result<Vec<PoolPgStat>, TelemetryError> {
        self.fetch("pg/dump?dumpcontents=pools")
    }

    async fn pools(&self) -> Result<Vec<PoolName>, TelemetryError> {
        self.fetch("osd/lspools")
    }

    async fn pg_dump(&self) -> Result<PgDumpDoc, TelemetryError> {
        self.fetch("pg/dump")
    }

    async fn pg_brief(&self) -> Result<Vec<PgBrief>, TelemetryError> {
        self.fetch("pg/dump?dumpcontents=pgs_brief")
    }

    async fn osd_tree(&self) -> Result<OsdTreeDoc, TelemetryError> {
        self.fetch("osd/tree")
    }
}

/// A small cluster: OSDs 0 and 1 up+in on node1, OSD 2 down+out on node2,
/// one monitor in quorum, pool `rbd` with one clean and one down PG.
pub fn sample_cluster() -> StaticSource {
    let osd = |id: i64, ip: &str, up: u8| {
        json!({
            "osd": id,
            "uuid": format!("0000000{}-aaaa-bbbb-cccc-dddddddddddd", id),
            "up": up,
            "in": up,
            "up_from": 10,
            "public_addr": format!("{}:680{}/1234", ip, id),
            "cluster_addr": format!("{}:681{}/1234", ip, id),
            "heartbeat_back_addr": format!("{}:682{}/1234", ip, id),
            "heartbeat_front_addr": format!("{}:683{}/1234", ip, id)
        })
    };
    let mons = json!([{"rank": 0, "name": "a", "addr": "10.0.0.1:6789/0"}]);

    StaticSource::new()
        .with_doc(
            "status",
            json!({
                "mdsmap": {"max": 1, "up": 1, "in": 1},
                "monmap": {"mons": mons},
                "quorum": [0],
                "pgmap": {"pgs_by_state": [
                    {"state_name": "active+clean", "count": 1},
                    {"state_name": "down+peering", "count": 1}
                ]}
            }),
        )
        .with_doc(
            "df",
            json!({
                "stats": {"total_used": 1024, "total_space": 4096, "total_avail": 3072},
                "pools": [{"id": 0, "name": "rbd", "stats": {"bytes_used": 5000, "objects": 12}}]
            }),
        )
        .with_doc(
            "health?detail",
            json!({"overall_status": "HEALTH_WARN", "summary": [{"severity": "HEALTH_WARN", "summary": "1 pgs down"}], "detail": []}),
        )
        .with_doc(
            "osd/dump",
            json!({
                "osds": [osd(0, "10.0.0.1", 1), osd(1, "10.0.0.1", 1), osd(2, "10.0.0.2", 0)],
                "pools": [{"pool": 0, "pool_name": "rbd", "quota_max_bytes": 0, "quota_max_objects": 100}]
            }),
        )
        .with_doc("mon_status", json!({"monmap": {"mons": mons}, "quorum": [0]}))
        .with_doc(
            "pg/dump?dumpcontents=pools",
            json!([{"poolid": 0, "stat_sum": {"num_objects": 12, "num_objects_degraded": 0}}]),
        )
        .with_doc("osd/lspools", json!([{"poolnum": 0, "poolname": "rbd"}]))
        .with_doc(
            "pg/dump",
            json!({"pg_stats": [
                {"pgid": "0.0", "acting": [0, 1], "up": [0, 1], "state": "active+clean"},
                {"pgid": "0.1", "acting": [2], "up": [2], "state": "down+peering"}
            ]}),
        )
        .with_doc(
            "pg/dump?dumpcontents=pgs_brief",
            json!([
                {"pgid": "0.0", "acting": [0, 1], "up": [0, 1], "state": "active+clean"},
                {"pgid": "0.1", "acting": [2], "up": [2], "state": "down+peering"}
            ]),
        )
        .with_doc(
            "osd/tree",
            json!({"nodes": [
                {"id": -1, "name": "default", "type": "root", "children": [-2, -3]},
                {"id": -2, "name": "node1", "type": "host", "children": [0, 1]},
                {"id": -3, "name": "node2", "type": "host", "children": [2]},
                {"id": 0, "name": "osd.0", "type": "osd"},
                {"id": 1, "name": "osd.1", "type": "osd"},
                {"id": 2, "name": "osd.2", "type": "osd"}
            ]}),
        )
}

/// Fixed reverse-DNS table and set of reachable monitor addresses.
#[derive(Debug, Default)]
pub struct StaticNetwork {
    names: HashMap<String, String>,
    reachable: HashSet<String>,
    lookups: Mutex<usize>,
    probes: Mutex<usize>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, ip: &str, hostname: &str) -> Self {
        self.names.insert(ip.to_string(), hostname.to_string());
        self
    }

    pub fn with_reachable(mut self, mon_addr: &str) -> Self {
        self.reachable.insert(mon_addr.to_string());
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn probes(&self) -> usize {
        self.probes.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl NetworkProbe for StaticNetwork {
    async fn reverse_resolve(&self, ip: &str) -> Option<String> {
        if let Ok(mut n) = self.lookups.lock() {
            *n += 1;
        }
        self.names.get(ip).cloned()
    }

    async fn mon_reachable(&self, mon_addr: &str) -> bool {
        if let Ok(mut n) = self.probes.lock() {
            *n += 1;
        }
        self.reachable.contains(mon_addr)
    }
}
