use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::model::OsdId;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("HTTP error querying {url}: {msg}")]
    Http { url: String, msg: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Parse error for {endpoint}: {msg}")]
    Parse { endpoint: String, msg: String },
    #[error("Response from {endpoint} has no 'output' member")]
    MissingOutput { endpoint: String },
}

impl TelemetryError {
    /// True when the failure came from talking to the REST API rather than
    /// from interpreting what it returned.
    pub fn is_client(&self) -> bool {
        matches!(self, TelemetryError::Http { .. } | TelemetryError::Status { .. })
    }
}

/// Ceph encodes OSD `up`/`in` as 0/1; some tools emit booleans.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    match Flag::deserialize(deserializer) {
        Ok(Flag::Bool(b)) => Ok(b),
        Ok(Flag::Int(i)) => Ok(i != 0),
        Err(_) => Err(de::Error::custom("expected a boolean or integer flag")),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonInfo {
    pub rank: i64,
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonMap {
    #[serde(default)]
    pub mons: Vec<MonInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MdsMapSummary {
    #[serde(default)]
    pub max: u64,
    #[serde(default)]
    pub up: u64,
    #[serde(default, rename = "in")]
    pub in_: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PgStateCount {
    pub state_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PgMapSummary {
    #[serde(default)]
    pub pgs_by_state: Vec<PgStateCount>,
}

/// `ceph status`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatusDoc {
    #[serde(default)]
    pub mdsmap: MdsMapSummary,
    #[serde(default)]
    pub monmap: MonMap,
    #[serde(default)]
    pub quorum: Vec<i64>,
    #[serde(default)]
    pub pgmap: PgMapSummary,
}

/// Totals are in KiB.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DfTotals {
    pub total_used: u64,
    pub total_space: u64,
    pub total_avail: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DfPoolStats {
    #[serde(default)]
    pub bytes_used: u64,
    #[serde(default)]
    pub objects: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DfPool {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub stats: DfPoolStats,
}

/// `ceph df`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DfDoc {
    pub stats: DfTotals,
    #[serde(default)]
    pub pools: Vec<DfPool>,
}

/// `ceph health detail`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthDoc {
    pub overall_status: String,
    #[serde(default)]
    pub summary: serde_json::Value,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsdInfo {
    pub osd: OsdId,
    #[serde(default)]
    pub uuid: String,
    #[serde(deserialize_with = "flag")]
    pub up: bool,
    #[serde(rename = "in", deserialize_with = "flag")]
    pub in_: bool,
    #[serde(default)]
    pub up_from: u64,
    pub public_addr: String,
    #[serde(default)]
    pub cluster_addr: String,
    #[serde(default)]
    pub heartbeat_back_addr: String,
    #[serde(default)]
    pub heartbeat_front_addr: String,
}

impl OsdInfo {
    pub fn service_name(&self) -> String {
        format!("osd.{}", self.osd)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsdMapPool {
    pub pool: i64,
    pub pool_name: String,
    #[serde(default)]
    pub quota_max_bytes: u64,
    #[serde(default)]
    pub quota_max_objects: u64,
}

/// `ceph osd dump`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OsdMapDoc {
    #[serde(default)]
    pub osds: Vec<OsdInfo>,
    #[serde(default)]
    pub pools: Vec<OsdMapPool>,
}

/// `ceph mon_status`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonStatusDoc {
    #[serde(default)]
    pub monmap: MonMap,
    #[serde(default)]
    pub quorum: Vec<i64>,
}

/// One row of `ceph pg dump pools`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolPgStat {
    #[serde(default)]
    pub poolid: i64,
    #[serde(default)]
    pub stat_sum: HashMap<String, i64>,
}

/// One row of `ceph osd lspools`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolName {
    pub poolnum: i64,
    pub poolname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PgBrief {
    pub pgid: String,
    #[serde(default)]
    pub acting: Vec<OsdId>,
    #[serde(default)]
    pub up: Vec<OsdId>,
    pub state: String,
}

/// `ceph pg dump`; only the per-PG rows are read.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PgDumpDoc {
    #[serde(default)]
    pub pg_stats: Vec<PgBrief>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrushNode {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub children: Vec<i64>,
}

/// `ceph osd tree`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OsdTreeDoc {
    #[serde(default)]
    pub nodes: Vec<CrushNode>,
}

/// Source of raw cluster documents for one refresh pass.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn status(&self) -> Result<StatusDoc, TelemetryError>;
    async fn space_stats(&self) -> Result<DfDoc, TelemetryError>;
    async fn health(&self) -> Result<HealthDoc, TelemetryError>;
    async fn osd_map(&self) -> Result<OsdMapDoc, TelemetryError>;
    async fn mon_status(&self) -> Result<MonStatusDoc, TelemetryError>;
    async fn pool_pg_stats(&self) -> Result<Vec<PoolPgStat>, TelemetryError>;
    async fn pools(&self) -> Result<Vec<PoolName>, TelemetryError>;
    async fn pg_dump(&self) -> Result<PgDumpDoc, TelemetryError>;
    async fn pg_brief(&self) -> Result<Vec<PgBrief>, TelemetryError>;
    async fn osd_tree(&self) -> Result<OsdTreeDoc, TelemetryError>;
}

/// Per-pass memo of endpoint responses. Create one per pass and drop it
/// with the client; nothing here is ever invalidated.
#[derive(Debug, Default)]
pub struct PassCache {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &str) -> Option<serde_json::Value> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(endpoint).cloned())
    }

    pub fn insert(&self, endpoint: &str, value: serde_json::Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(endpoint.to_string(), value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client for the Ceph REST API (`ceph-rest-api`).
pub struct CephRestClient {
    client: reqwest::Client,
    base_url: String,
    cache: PassCache,
}

/// HTTP client whose every request is bounded by `timeout`.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, TelemetryError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TelemetryError::Http {
            url: String::new(),
            msg: format!("Failed to build HTTP client: {}", e),
        })
}

impl CephRestClient {
    pub fn new(base_url: &str, timeout: Duration, cache: PassCache) -> Result<Self, TelemetryError> {
        Ok(Self::with_client(http_client(timeout)?, base_url, cache))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, cache: PassCache) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            cache,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> &PassCache {
        &self.cache
    }

    async fn query(&self, endpoint: &str) -> Result<serde_json::Value, TelemetryError> {
        if let Some(hit) = self.cache.get(endpoint) {
            tracing::trace!(endpoint, "telemetry cache hit");
            return Ok(hit);
        }

        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| TelemetryError::Http {
                url: url.clone(),
                msg: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TelemetryError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| TelemetryError::Http {
            url: url.clone(),
            msg: format!("Read error: {}", e),
        })?;
        let body: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| TelemetryError::Parse {
                endpoint: endpoint.to_string(),
                msg: e.to_string(),
            })?;
        let output = extract_output(endpoint, body)?;
        self.cache.insert(endpoint, output.clone());
        Ok(output)
    }

    async fn query_as<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, TelemetryError> {
        let output = self.query(endpoint).await?;
        decode(endpoint, output)
    }
}

pub fn normalize_base_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

fn extract_output(endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value, TelemetryError> {
    match body {
        serde_json::Value::Object(mut map) => {
            map.remove("output").ok_or_else(|| TelemetryError::MissingOutput {
                endpoint: endpoint.to_string(),
            })
        }
        _ => Err(TelemetryError::MissingOutput {
            endpoint: endpoint.to_string(),
        }),
    }
}

pub fn decode<T: serde::de::DeserializeOwned>(
    endpoint: &str,
    value: serde_json::Value,
) -> Result<T, TelemetryError> {
    serde_json::from_value(value).map_err(|e| TelemetryError::Parse {
        endpoint: endpoint.to_string(),
        msg: e.to_string(),
    })
}

#[async_trait]
impl TelemetrySource for CephRestClient {
    async fn status(&self) -> Result<StatusDoc, TelemetryError> {
        self.query_as("status").await
    }

    async fn space_stats(&self) -> Result<DfDoc, TelemetryError> {
        self.query_as("df").await
    }

    async fn health(&self) -> Result<HealthDoc, TelemetryError> {
        self.query_as("health?detail").await
    }

    async fn osd_map(&self) -> Result<OsdMapDoc, TelemetryError> {
        self.query_as("osd/dump").await
    }

    async fn mon_status(&self) -> Result<MonStatusDoc, TelemetryError> {
        self.query_as("mon_status").await
    }

    async fn pool_pg_stats(&self) -> Result<Vec<PoolPgStat>, TelemetryError> {
        self.query_as("pg/dump?dumpcontents=pools").await
    }

    async fn pools(&self) -> Result<Vec<PoolName>, TelemetryError> {
        self.query_as("osd/lspools").await
    }

    async fn pg_dump(&self) -> Result<PgDumpDoc, TelemetryError> {
        self.query_as("pg/dump").await
    }

    async fn pg_brief(&self) -> Result<Vec<PgBrief>, TelemetryError> {
        self.query_as("pg/dump?dumpcontents=pgs_brief").await
    }

    async fn osd_tree(&self) -> Result<OsdTreeDoc, TelemetryError> {
        self.query_as("osd/tree").await
    }
}
