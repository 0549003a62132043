//! Runs a refresh pass over every registered cluster, one after another.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClusterSeed;
use crate::model::{AttemptError, Cluster, ClusterId, RefreshAttempt};
use crate::net::NetworkProbe;
use crate::snapshot::{BuildOptions, RefreshError, SnapshotBuilder};
use crate::store::{ChangeLog, ClusterStore, StoreError};
use crate::telemetry::{http_client, CephRestClient, PassCache, TelemetryError, TelemetrySource};

/// Opens a telemetry source for one pass over one cluster.
pub trait TelemetryConnector: Send + Sync {
    fn connect(&self, cluster: &Cluster) -> Box<dyn TelemetrySource>;
}

impl<F> TelemetryConnector for F
where
    F: Fn(&Cluster) -> Box<dyn TelemetrySource> + Send + Sync,
{
    fn connect(&self, cluster: &Cluster) -> Box<dyn TelemetrySource> {
        self(cluster)
    }
}

/// Connects to each cluster's REST API with a fresh per-pass cache.
pub struct RestConnector {
    client: reqwest::Client,
}

impl RestConnector {
    pub fn new(timeout: Duration) -> Result<Self, TelemetryError> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

impl TelemetryConnector for RestConnector {
    fn connect(&self, cluster: &Cluster) -> Box<dyn TelemetrySource> {
        Box::new(CephRestClient::with_client(
            self.client.clone(),
            &cluster.api_base_url,
            PassCache::new(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub cluster_id: ClusterId,
    pub name: String,
    pub changes: ChangeLog,
    pub error: Option<AttemptError>,
}

impl ClusterOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub outcomes: Vec<ClusterOutcome>,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

pub struct Refresher {
    store: Arc<dyn ClusterStore>,
    net: Arc<dyn NetworkProbe>,
    connector: Arc<dyn TelemetryConnector>,
    options: BuildOptions,
}

impl Refresher {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        net: Arc<dyn NetworkProbe>,
        connector: Arc<dyn TelemetryConnector>,
        options: BuildOptions,
    ) -> Self {
        Self {
            store,
            net,
            connector,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// One pass over all clusters in id order. A failing cluster is recorded
    /// and skipped; only an unreadable cluster list fails the whole run.
    pub async fn refresh_all(&self) -> Result<RefreshReport, StoreError> {
        let clusters = self.store.clusters()?;
        let mut report = RefreshReport::default();
        for cluster in &clusters {
            report.outcomes.push(self.refresh_cluster(cluster).await);
        }
        tracing::info!(
            clusters = clusters.len(),
            ok = report.succeeded(),
            failed = report.failed(),
            "refresh run complete"
        );
        Ok(report)
    }

    pub async fn refresh_cluster(&self, cluster: &Cluster) -> ClusterOutcome {
        let started = Utc::now();
        self.record(cluster.id, RefreshAttempt { at: started, error: None });

        tracing::info!(cluster = cluster.id, name = %cluster.name, "refreshing cluster");
        let source = self.connector.connect(cluster);
        match self.run_pass(cluster.id, source.as_ref()).await {
            Ok(changes) => {
                tracing::debug!(
                    cluster = cluster.id,
                    created = changes.created,
                    updated = changes.updated,
                    deleted = changes.deleted,
                    "cluster refreshed"
                );
                ClusterOutcome {
                    cluster_id: cluster.id,
                    name: cluster.name.clone(),
                    changes,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(cluster = cluster.id, name = %cluster.name, error = %e, "refresh failed");
                let error = AttemptError {
                    message: e.to_string(),
                    is_client: e.is_client(),
                };
                self.record(
                    cluster.id,
                    RefreshAttempt {
                        at: started,
                        error: Some(error.clone()),
                    },
                );
                ClusterOutcome {
                    cluster_id: cluster.id,
                    name: cluster.name.clone(),
                    changes: ChangeLog::default(),
                    error: Some(error),
                }
            }
        }
    }

    async fn run_pass(
        &self,
        cluster_id: ClusterId,
        source: &dyn TelemetrySource,
    ) -> Result<ChangeLog, RefreshError> {
        let mut txn = self.store.begin(cluster_id)?;
        let snapshot = SnapshotBuilder::new(source, self.net.as_ref(), &self.options)
            .build(&mut txn)
            .await?;
        let changes = txn.changes();
        txn.set_snapshot(snapshot, Utc::now());
        self.store.commit(txn)?;
        Ok(changes)
    }

    fn record(&self, cluster_id: ClusterId, attempt: RefreshAttempt) {
        if let Err(e) = self.store.record_attempt(cluster_id, &attempt) {
            tracing::error!(cluster = cluster_id, error = %e, "failed to record refresh attempt");
        }
    }

    /// Refreshes forever, one run per `interval`.
    pub async fn run_forever(&self, interval: Duration) {
        loop {
            if let Err(e) = self.refresh_all().await {
                tracing::error!("Refresh run failed: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Registers every seed whose name is not yet known. Returns the clusters added.
pub fn seed_clusters(store: &dyn ClusterStore, seeds: &[ClusterSeed]) -> Result<Vec<Cluster>, StoreError> {
    let known: Vec<String> = store.clusters()?.into_iter().map(|c| c.name).collect();
    let mut added = Vec::new();
    for seed in seeds {
        if known.contains(&seed.name) || added.iter().any(|c: &Cluster| c.name == seed.name) {
            continue;
        }
        let cluster = store.add_cluster(&seed.name, &seed.api_base_url)?;
        tracing::info!(cluster = cluster.id, name = %cluster.name, "registered seed cluster");
        added.push(cluster);
    }
    Ok(added)
}
