//! Keeps the server/service directory in step with the OSD and monitor maps.

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::addr::short_address;
use crate::model::ServiceKind;
use crate::net::NetworkProbe;
use crate::store::ClusterTxn;
use crate::telemetry::{MonInfo, OsdInfo, TelemetryError, TelemetrySource};
use crate::topology::{CrushTypes, OsdHostIndex, TopologyError, LOCALHOST};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("Malformed CRUSH tree: {0}")]
    Topology(#[from] TopologyError),
}

/// What one reconciliation changed, plus where each OSD lives.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// `osd.N` to the address of the server hosting it.
    pub osd_servers: HashMap<String, String>,
    pub removed_services: usize,
    pub removed_servers: usize,
}

pub struct ServiceRegistry<'a> {
    source: &'a dyn TelemetrySource,
    net: &'a dyn NetworkProbe,
    crush_types: &'a CrushTypes,
    crush: Option<OsdHostIndex>,
}

impl<'a> ServiceRegistry<'a> {
    pub fn new(
        source: &'a dyn TelemetrySource,
        net: &'a dyn NetworkProbe,
        crush_types: &'a CrushTypes,
    ) -> Self {
        Self {
            source,
            net,
            crush_types,
            crush: None,
        }
    }

    pub async fn reconcile(
        &mut self,
        txn: &mut ClusterTxn,
        osds: &[OsdInfo],
        mons: &[MonInfo],
    ) -> Result<ReconcileOutcome, RegistryError> {
        let mut stale_services: BTreeSet<u64> = txn.service_ids();
        let mut stale_servers: BTreeSet<String> = txn.server_addrs();
        let mut outcome = ReconcileOutcome::default();

        for osd in osds {
            let addr = short_address(&osd.public_addr).to_string();
            let name = osd.service_name();
            let id = self
                .register_service(txn, &addr, ServiceKind::Osd, osd.osd, &name)
                .await?;
            stale_services.remove(&id);
            stale_servers.remove(&addr);
            outcome.osd_servers.insert(name, addr);
        }

        for mon in mons {
            let addr = short_address(&mon.addr).to_string();
            let name = format!("mon.{}", mon.name);
            let id = self
                .register_service(txn, &addr, ServiceKind::Mon, mon.rank, &name)
                .await?;
            stale_services.remove(&id);
            stale_servers.remove(&addr);
        }

        outcome.removed_services = txn.delete_services(&stale_services);
        outcome.removed_servers = txn.delete_servers(&stale_servers);
        if outcome.removed_services > 0 || outcome.removed_servers > 0 {
            tracing::info!(
                cluster = txn.cluster_id(),
                services = outcome.removed_services,
                servers = outcome.removed_servers,
                "removed services no longer reported"
            );
        }
        Ok(outcome)
    }

    async fn register_service(
        &mut self,
        txn: &mut ClusterTxn,
        addr: &str,
        kind: ServiceKind,
        service_id: i64,
        name: &str,
    ) -> Result<u64, RegistryError> {
        txn.get_or_create_server(addr);
        let (id, created) = txn.get_or_create_service(addr, kind, service_id, name);
        if !created {
            return Ok(id);
        }

        let migrated = txn.delete_services_where(|s| {
            s.kind == kind && s.service_id == service_id && s.server_addr != addr
        });
        if migrated > 0 {
            tracing::info!(service = name, to = addr, "service moved to a new server");
        }

        let Some(mut server) = txn.server(addr).cloned() else {
            return Ok(id);
        };

        if !server.resolved {
            match kind {
                ServiceKind::Osd => {
                    let hostname = match self.crush_host(name).await? {
                        Some(host) if host != LOCALHOST => host,
                        _ => self
                            .net
                            .reverse_resolve(addr)
                            .await
                            .unwrap_or_else(|| LOCALHOST.to_string()),
                    };
                    server.set_resolved(hostname);
                }
                ServiceKind::Mon => match self.net.reverse_resolve(addr).await {
                    Some(hostname) => server.set_resolved(hostname),
                    None => server.name = Some(name.to_string()),
                },
            }
        }

        if server.name.is_none() {
            server.name = Some(addr.to_string());
        }
        txn.update_server(server);
        Ok(id)
    }

    async fn crush_host(&mut self, osd_name: &str) -> Result<Option<String>, RegistryError> {
        if self.crush.is_none() {
            let tree = self.source.osd_tree().await?;
            self.crush = Some(OsdHostIndex::build(&tree, self.crush_types)?);
        }
        Ok(self
            .crush
            .as_ref()
            .and_then(|index| index.host_of(osd_name))
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{StaticNetwork, StaticSource};
    use crate::store::{ClusterRecords, ClusterTxn};
    use crate::telemetry::{CrushNode, OsdTreeDoc};

    fn osd(id: i64, addr: &str) -> OsdInfo {
        OsdInfo {
            osd: id,
            uuid: format!("uuid-{}", id),
            up: true,
            in_: true,
            up_from: 1,
            public_addr: format!("{}:6800/1", addr),
            cluster_addr: String::new(),
            heartbeat_back_addr: String::new(),
            heartbeat_front_addr: String::new(),
        }
    }

    fn mon(rank: i64, name: &str, addr: &str) -> MonInfo {
        MonInfo {
            rank,
            name: name.to_string(),
            addr: format!("{}:6789/0", addr),
        }
    }

    fn crush(hosts: &[(&str, &[i64])]) -> OsdTreeDoc {
        let mut nodes = Vec::new();
        for (i, (host, osds)) in hosts.iter().enumerate() {
            nodes.push(CrushNode {
                id: -(i as i64) - 2,
                name: host.to_string(),
                node_type: "host".to_string(),
                children: osds.to_vec(),
            });
            for id in *osds {
                nodes.push(CrushNode {
                    id: *id,
                    name: format!("osd.{}", id),
                    node_type: "osd".to_string(),
                    children: vec![],
                });
            }
        }
        OsdTreeDoc { nodes }
    }

    fn txn() -> ClusterTxn {
        ClusterTxn::new(1, ClusterRecords::default())
    }

    #[tokio::test]
    async fn test_osd_host_from_crush() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[0, 1])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let mut registry = ServiceRegistry::new(&source, &net, &types);
        let mut txn = txn();

        let outcome = registry
            .reconcile(&mut txn, &[osd(0, "10.0.0.1"), osd(1, "10.0.0.1")], &[])
            .await
            .unwrap();

        let server = txn.server("10.0.0.1").unwrap();
        assert_eq!(server.hostname.as_deref(), Some("node1"));
        assert_eq!(server.name.as_deref(), Some("node1"));
        assert!(server.resolved);
        assert_eq!(outcome.osd_servers.get("osd.1").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(net.lookups(), 0);
    }

    #[tokio::test]
    async fn test_osd_falls_back_to_reverse_dns_then_localhost() {
        let source = StaticSource::new().with_osd_tree(crush(&[("localhost", &[0])]));
        let net = StaticNetwork::new().with_name("10.0.0.1", "store1");
        let types = CrushTypes::default();
        let mut registry = ServiceRegistry::new(&source, &net, &types);
        let mut txn = txn();

        registry
            .reconcile(&mut txn, &[osd(0, "10.0.0.1"), osd(1, "10.0.0.2")], &[])
            .await
            .unwrap();

        assert_eq!(txn.server("10.0.0.1").unwrap().hostname.as_deref(), Some("store1"));
        assert_eq!(txn.server("10.0.0.2").unwrap().hostname.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn test_mon_uses_dns_or_own_name() {
        let source = StaticSource::new();
        let net = StaticNetwork::new().with_name("10.0.1.1", "mon-host-a");
        let types = CrushTypes::default();
        let mut registry = ServiceRegistry::new(&source, &net, &types);
        let mut txn = txn();

        registry
            .reconcile(
                &mut txn,
                &[],
                &[mon(0, "a", "10.0.1.1"), mon(1, "b", "10.0.1.2")],
            )
            .await
            .unwrap();

        let a = txn.server("10.0.1.1").unwrap();
        assert_eq!(a.hostname.as_deref(), Some("mon-host-a"));
        let b = txn.server("10.0.1.2").unwrap();
        assert_eq!(b.hostname, None);
        assert_eq!(b.name.as_deref(), Some("mon.b"));
        assert!(!b.resolved);
        // Monitors never consult the CRUSH tree.
        assert_eq!(source.fetches("osd/tree"), 0);
    }

    #[tokio::test]
    async fn test_unresolved_mon_server_named_after_newest_mon() {
        let source = StaticSource::new();
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let mut txn = txn();

        ServiceRegistry::new(&source, &net, &types)
            .reconcile(
                &mut txn,
                &[],
                &[mon(0, "a", "10.0.1.5"), mon(1, "b", "10.0.1.5")],
            )
            .await
            .unwrap();

        let server = txn.server("10.0.1.5").unwrap();
        assert_eq!(server.name.as_deref(), Some("mon.b"));
        assert!(!server.resolved);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[0]), ("node2", &[1])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let osds = [osd(0, "10.0.0.1"), osd(1, "10.0.0.2")];
        let mons = [mon(0, "a", "10.0.0.1")];

        let mut first = txn();
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut first, &osds, &mons)
            .await
            .unwrap();
        assert!(!first.changes().is_empty());

        let mut second = ClusterTxn::new(1, first.records().clone());
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut second, &osds, &mons)
            .await
            .unwrap();
        assert!(second.changes().is_empty());
        assert_eq!(second.records(), first.records());
    }

    #[tokio::test]
    async fn test_osd_migration_leaves_single_record() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[5])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();

        let mut pass1 = txn();
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass1, &[osd(5, "10.0.0.1")], &[])
            .await
            .unwrap();

        let mut pass2 = ClusterTxn::new(1, pass1.records().clone());
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass2, &[osd(5, "10.0.0.2")], &[])
            .await
            .unwrap();

        let records = pass2.services_of(ServiceKind::Osd, 5);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].server_addr, "10.0.0.2");
        assert!(pass2.server("10.0.0.1").is_none());
    }

    #[tokio::test]
    async fn test_server_kept_while_other_service_remains() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[5])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let mons = [mon(0, "a", "10.0.0.1")];

        let mut pass1 = txn();
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass1, &[osd(5, "10.0.0.1")], &mons)
            .await
            .unwrap();

        let mut pass2 = ClusterTxn::new(1, pass1.records().clone());
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass2, &[osd(5, "10.0.0.2")], &mons)
            .await
            .unwrap();

        assert!(pass2.server("10.0.0.1").is_some());
        assert_eq!(pass2.services_of(ServiceKind::Osd, 5).len(), 1);
        assert_eq!(pass2.services_of(ServiceKind::Mon, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_removed_osd_deletes_service_and_server() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[0]), ("node2", &[1])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();

        let mut pass1 = txn();
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass1, &[osd(0, "10.0.0.1"), osd(1, "10.0.0.2")], &[])
            .await
            .unwrap();

        let mut pass2 = ClusterTxn::new(1, pass1.records().clone());
        let outcome = ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass2, &[osd(0, "10.0.0.1")], &[])
            .await
            .unwrap();

        assert_eq!(outcome.removed_services, 1);
        assert_eq!(outcome.removed_servers, 1);
        assert!(pass2.server("10.0.0.2").is_none());
    }

    #[tokio::test]
    async fn test_hostname_sticky_after_first_resolution() {
        let source = StaticSource::new().with_osd_tree(crush(&[]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();

        let mut pass1 = txn();
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass1, &[osd(0, "10.0.0.1")], &[])
            .await
            .unwrap();
        assert_eq!(pass1.server("10.0.0.1").unwrap().hostname.as_deref(), Some("localhost"));

        // A new OSD on the same server with a now-resolvable CRUSH host.
        let source = StaticSource::new().with_osd_tree(crush(&[("node1", &[0, 1])]));
        let mut pass2 = ClusterTxn::new(1, pass1.records().clone());
        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut pass2, &[osd(0, "10.0.0.1"), osd(1, "10.0.0.1")], &[])
            .await
            .unwrap();
        assert_eq!(pass2.server("10.0.0.1").unwrap().hostname.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn test_malformed_crush_fails_reconcile() {
        let tree = OsdTreeDoc {
            nodes: vec![CrushNode {
                id: -2,
                name: "node1".to_string(),
                node_type: "host".to_string(),
                children: vec![42],
            }],
        };
        let source = StaticSource::new().with_osd_tree(tree);
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let mut txn = txn();

        let err = ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut txn, &[osd(0, "10.0.0.1")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Topology(_)));
    }

    #[tokio::test]
    async fn test_ipv6_addresses_registered_bare() {
        let source = StaticSource::new().with_osd_tree(crush(&[("node6", &[0])]));
        let net = StaticNetwork::new();
        let types = CrushTypes::default();
        let mut txn = txn();
        let mut v6 = osd(0, "x");
        v6.public_addr = "[fe80::1]:6800/0".to_string();

        ServiceRegistry::new(&source, &net, &types)
            .reconcile(&mut txn, &[v6], &[])
            .await
            .unwrap();
        assert!(txn.server("fe80::1").is_some());
    }
}
