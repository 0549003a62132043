use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::snapshot::BuildOptions;
use crate::topology::CrushTypes;

/// A cluster to register at startup if no cluster of that name exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSeed {
    pub name: String,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonConfig {
    pub bind_addr: SocketAddr,
    /// JSON state file. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    pub restapi_timeout_secs: f64,
    pub monitor_timeout_secs: f64,
    pub dns_timeout_secs: f64,
    pub refresh_interval_secs: u64,
    pub crush_host_type: String,
    pub crush_osd_type: String,
    pub full_pg_dump: bool,
    pub admin_token: Option<String>,
    pub clusters: Vec<ClusterSeed>,
}

impl Default for MonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8002)),
            store_path: Some(PathBuf::from("/var/lib/cephmon/state.json")),
            restapi_timeout_secs: 30.0,
            monitor_timeout_secs: 5.0,
            dns_timeout_secs: 2.0,
            refresh_interval_secs: 60,
            crush_host_type: String::from("host"),
            crush_osd_type: String::from("osd"),
            full_pg_dump: false,
            admin_token: None,
            clusters: Vec::new(),
        }
    }
}

impl MonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MonConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, secs) in [
            ("restapi_timeout_secs", self.restapi_timeout_secs),
            ("monitor_timeout_secs", self.monitor_timeout_secs),
            ("dns_timeout_secs", self.dns_timeout_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                anyhow::bail!("{} must be a positive number of seconds, got {}", name, secs);
            }
        }
        if self.refresh_interval_secs == 0 {
            anyhow::bail!("refresh_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn restapi_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.restapi_timeout_secs)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dns_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            crush_types: CrushTypes {
                host: self.crush_host_type.clone(),
                osd: self.crush_osd_type.clone(),
            },
            full_pg_dump: self.full_pg_dump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MonConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8002)));
        assert_eq!(config.restapi_timeout(), Duration::from_secs(30));
        assert_eq!(config.monitor_timeout(), Duration::from_secs(5));
        assert_eq!(config.dns_timeout(), Duration::from_secs(2));
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.crush_host_type, "host");
        assert_eq!(config.crush_osd_type, "osd");
        assert!(!config.full_pg_dump);
        assert!(config.admin_token.is_none());
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_from_file_json_partial() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "bind_addr": "127.0.0.1:9000",
                "monitor_timeout_secs": 1.5,
                "clusters": [{{"name": "ceph", "api_base_url": "http://mon1:5000/api/v0.1"}}]
            }}"#
        )
        .unwrap();

        let config = MonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.monitor_timeout(), Duration::from_millis(1500));
        assert_eq!(config.restapi_timeout(), Duration::from_secs(30));
        assert_eq!(config.clusters[0].name, "ceph");
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "10.0.0.1:8080"
store_path = "/tmp/cephmon.json"
full_pg_dump = true
crush_host_type = "chassis"
admin_token = "test-token"

[[clusters]]
name = "prod"
api_base_url = "http://mon1:5000/api/v0.1/"
            "#
        )
        .unwrap();

        let config = MonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([10, 0, 0, 1], 8080)));
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/cephmon.json")));
        assert_eq!(config.admin_token, Some("test-token".to_string()));
        let options = config.build_options();
        assert!(options.full_pg_dump);
        assert_eq!(options.crush_types.host, "chassis");
        assert_eq!(options.crush_types.osd, "osd");
        assert_eq!(
            config.clusters,
            vec![ClusterSeed {
                name: "prod".to_string(),
                api_base_url: "http://mon1:5000/api/v0.1/".to_string(),
            }]
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_rejects_non_positive_timeout() {
        let config = MonConfig {
            dns_timeout_secs: 0.0,
            ..MonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.refresh_interval_secs, 60);
    }
}
