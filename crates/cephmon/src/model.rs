use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type ClusterId = u64;
pub type OsdId = i64;

/// A registered cluster plus the last snapshot taken from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub api_base_url: String,
    #[serde(default)]
    pub snapshot: Option<ClusterSnapshot>,
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_error_msg: Option<String>,
    #[serde(default)]
    pub update_error_isclient: bool,
}

impl Cluster {
    pub fn new(id: ClusterId, name: String, api_base_url: String) -> Self {
        Self {
            id,
            name,
            api_base_url,
            snapshot: None,
            update_time: None,
            update_attempt_time: None,
            update_error_msg: None,
            update_error_isclient: false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.update_error_msg.is_some()
    }
}

/// Outcome of one refresh attempt, written whether or not the pass succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshAttempt {
    pub at: DateTime<Utc>,
    pub error: Option<AttemptError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptError {
    pub message: String,
    pub is_client: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: String,
    pub summary: serde_json::Value,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_id: i64,
    pub name: String,
    pub quota_max_bytes: u64,
    pub quota_max_objects: u64,
    pub used_bytes: u64,
    pub used_objects: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsdRecord {
    pub id: OsdId,
    pub uuid: String,
    pub up: bool,
    #[serde(rename = "in")]
    pub in_: bool,
    pub up_from: u64,
    pub public_addr: String,
    pub cluster_addr: String,
    pub heartbeat_back_addr: String,
    pub heartbeat_front_addr: String,
    pub host: Option<String>,
    pub pg_states: BTreeMap<String, u64>,
    pub pg_count: u64,
    pub pools: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgRecord {
    pub pgid: String,
    pub acting: Vec<OsdId>,
    pub up: Vec<OsdId>,
    pub state: Vec<String>,
}

impl PgRecord {
    /// Pool id encoded in the `<pool>.<shard>` pgid.
    pub fn pool_id(&self) -> Option<i64> {
        self.pgid.split('.').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Critical,
}

/// One severity tier: total count and the labels that contributed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityBucket {
    pub count: u64,
    pub states: BTreeMap<String, u64>,
}

impl SeverityBucket {
    pub fn add(&mut self, count: u64) {
        self.count += count;
    }

    pub fn add_labelled(&mut self, label: &str, count: u64) {
        *self.states.entry(label.to_string()).or_insert(0) += count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub ok: SeverityBucket,
    pub warn: SeverityBucket,
    pub critical: SeverityBucket,
}

impl SeverityCounts {
    pub fn bucket_mut(&mut self, severity: Severity) -> &mut SeverityBucket {
        match severity {
            Severity::Ok => &mut self.ok,
            Severity::Warn => &mut self.warn,
            Severity::Critical => &mut self.critical,
        }
    }

    pub fn total(&self) -> u64 {
        self.ok.count + self.warn.count + self.critical.count
    }

    /// Worst tier with a non-zero count.
    pub fn worst(&self) -> Option<Severity> {
        if self.critical.count > 0 {
            Some(Severity::Critical)
        } else if self.warn.count > 0 {
            Some(Severity::Warn)
        } else if self.ok.count > 0 {
            Some(Severity::Ok)
        } else {
            None
        }
    }
}

/// Number of pools with a non-zero value per error field, plus the pool total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounters {
    pub total: u64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub pool: PoolCounters,
    pub osd: SeverityCounts,
    pub mds: SeverityCounts,
    pub mon: SeverityCounts,
    pub pg: SeverityCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub space: SpaceStats,
    pub health: HealthReport,
    pub pools: Vec<PoolRecord>,
    pub osds: Vec<OsdRecord>,
    pub pgs: Vec<PgRecord>,
    pub counters: Counters,
    pub osds_by_pg_state: BTreeMap<String, BTreeSet<OsdId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Osd,
    Mon,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Osd => write!(f, "osd"),
            ServiceKind::Mon => write!(f, "mon"),
        }
    }
}

/// A network endpoint hosting one or more services.
///
/// `hostname` and `name` are filled in once, on the first sighting of a
/// service at this address; `resolved` records that the hostname lookup
/// succeeded and must not be repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub addr: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

impl ServerRecord {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            name: None,
            hostname: None,
            resolved: false,
        }
    }

    /// Hostname if known, otherwise the raw address.
    pub fn display_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.addr)
    }

    pub fn set_resolved(&mut self, hostname: String) {
        self.name = Some(hostname.clone());
        self.hostname = Some(hostname);
        self.resolved = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusRecord {
    pub id: u64,
    pub server_addr: String,
    pub kind: ServiceKind,
    pub service_id: i64,
    pub name: String,
}

/// Server plus the services it currently hosts, as served to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: ServerRecord,
    pub services: Vec<ServiceStatusRecord>,
}
