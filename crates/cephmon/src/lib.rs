//! Ceph cluster state monitor: polls each registered cluster's REST API,
//! keeps a server/service directory in step with the OSD and monitor maps,
//! and stores a classified health snapshot per cluster.

pub mod addr;
pub mod api;
pub mod classify;
pub mod cli;
pub mod config;
pub mod fixture;
pub mod model;
pub mod net;
pub mod refresh;
pub mod registry;
pub mod security;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod topology;

pub use api::AdminApi;
pub use config::MonConfig;
pub use refresh::{RefreshReport, Refresher};
pub use snapshot::{RefreshError, SnapshotBuilder};
pub use store::{ClusterStore, JsonFileStore, MemoryStore};
