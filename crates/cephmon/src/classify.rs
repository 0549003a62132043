//! Collapses raw component states into ok/warn/critical counters.

use std::collections::BTreeSet;

use crate::model::{PoolCounters, Severity, SeverityCounts};
use crate::net::NetworkProbe;
use crate::telemetry::{MdsMapSummary, MonInfo, OsdInfo, PgStateCount, PoolPgStat};

pub const PG_CRITICAL_STATES: [&str; 5] = ["stale", "down", "peering", "inconsistent", "incomplete"];

pub const PG_WARN_STATES: [&str; 12] = [
    "creating",
    "recovery_wait",
    "recovering",
    "replay",
    "splitting",
    "degraded",
    "remapped",
    "scrubbing",
    "repair",
    "wait_backfill",
    "backfilling",
    "backfill_toofull",
];

pub const PG_OK_STATES: [&str; 2] = ["active", "clean"];

/// Pool stat_sum fields counted as "pools affected".
pub const POOL_COUNTER_FIELDS: [&str; 6] = [
    "num_objects_unfound",
    "num_objects_missing_on_primary",
    "num_deep_scrub_errors",
    "num_shallow_scrub_errors",
    "num_scrub_errors",
    "num_objects_degraded",
];

/// Splits a `+`-joined PG state string into distinct lower-case labels.
pub fn pg_labels(state_name: &str) -> BTreeSet<String> {
    state_name
        .split('+')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Tier of a PG label set and the labels that put it there. Critical wins
/// over warn, warn over ok. `None` if no label is recognised.
pub fn classify_pg(labels: &BTreeSet<String>) -> Option<(Severity, Vec<&str>)> {
    let tiers: [(Severity, &[&str]); 3] = [
        (Severity::Critical, &PG_CRITICAL_STATES),
        (Severity::Warn, &PG_WARN_STATES),
        (Severity::Ok, &PG_OK_STATES),
    ];
    for (severity, set) in tiers {
        let matched: Vec<&str> = labels
            .iter()
            .map(String::as_str)
            .filter(|l| set.contains(l))
            .collect();
        if !matched.is_empty() {
            return Some((severity, matched));
        }
    }
    None
}

pub fn pg_counters(pgs_by_state: &[PgStateCount]) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for entry in pgs_by_state {
        let labels = pg_labels(&entry.state_name);
        let Some((severity, matched)) = classify_pg(&labels) else {
            tracing::trace!(state = %entry.state_name, "PG state matches no tier");
            continue;
        };
        let bucket = counts.bucket_mut(severity);
        bucket.add(entry.count);
        for label in matched {
            bucket.add_labelled(label, entry.count);
        }
    }
    counts
}

pub fn osd_counters(osds: &[OsdInfo]) -> SeverityCounts {
    let (mut up_in, mut up_out, mut down_in, mut down_out) = (0u64, 0u64, 0u64, 0u64);
    for osd in osds {
        match (osd.up, osd.in_) {
            (true, true) => up_in += 1,
            (true, false) => up_out += 1,
            (false, true) => down_in += 1,
            (false, false) => down_out += 1,
        }
    }

    let mut counts = SeverityCounts::default();
    let labelled = [
        (Severity::Ok, "up/in", up_in),
        (Severity::Warn, "up/out", up_out),
        (Severity::Warn, "down/in", down_in),
        (Severity::Critical, "down/out", down_out),
    ];
    for (severity, label, n) in labelled {
        if n > 0 {
            let bucket = counts.bucket_mut(severity);
            bucket.add(n);
            bucket.add_labelled(label, n);
        }
    }
    counts
}

/// ok = in, warn = up but not in, critical = desired but not up.
pub fn mds_counters(mds: &MdsMapSummary) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    counts.ok.add(mds.in_);
    counts.warn.add(mds.up.saturating_sub(mds.in_));
    counts.critical.add(mds.max.saturating_sub(mds.up));
    counts
}

/// In quorum → ok; out of quorum but reachable → warn; unreachable → critical.
pub async fn mon_counters(mons: &[MonInfo], quorum: &[i64], net: &dyn NetworkProbe) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for mon in mons {
        let (severity, label) = if quorum.contains(&mon.rank) {
            (Severity::Ok, "in")
        } else if net.mon_reachable(&mon.addr).await {
            (Severity::Warn, "up")
        } else {
            tracing::warn!(mon = %mon.name, addr = %mon.addr, "monitor out of quorum and unreachable");
            (Severity::Critical, "out")
        };
        let bucket = counts.bucket_mut(severity);
        bucket.add(1);
        bucket.add_labelled(label, 1);
    }
    counts
}

/// Each pool adds `min(value, 1)` per field, so a field's counter is the
/// number of pools reporting that problem, not its magnitude.
pub fn pool_counters(stats: &[PoolPgStat]) -> PoolCounters {
    let mut counters = PoolCounters {
        total: stats.len() as u64,
        fields: POOL_COUNTER_FIELDS
            .iter()
            .map(|f| (f.to_string(), 0))
            .collect(),
    };
    for pool in stats {
        for field in POOL_COUNTER_FIELDS {
            if let Some(value) = pool.stat_sum.get(field) {
                if let Some(counter) = counters.fields.get_mut(field) {
                    *counter += (*value).min(1);
                }
            }
        }
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::StaticNetwork;
    use std::collections::HashMap;

    fn pg_state(name: &str, count: u64) -> PgStateCount {
        PgStateCount {
            state_name: name.to_string(),
            count,
        }
    }

    fn osd(up: bool, in_: bool) -> OsdInfo {
        OsdInfo {
            osd: 0,
            uuid: String::new(),
            up,
            in_,
            up_from: 0,
            public_addr: "10.0.0.1:6800/0".to_string(),
            cluster_addr: String::new(),
            heartbeat_back_addr: String::new(),
            heartbeat_front_addr: String::new(),
        }
    }

    fn mon(rank: i64, addr: &str) -> MonInfo {
        MonInfo {
            rank,
            name: format!("m{}", rank),
            addr: addr.to_string(),
        }
    }

    #[test]
    fn test_pg_labels_lowercased_and_split() {
        let labels = pg_labels("Active+Clean+scrubbing");
        assert!(labels.contains("active"));
        assert!(labels.contains("clean"));
        assert!(labels.contains("scrubbing"));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_pg_critical_precedence() {
        let counts = pg_counters(&[pg_state("active+clean+down+degraded", 4)]);
        assert_eq!(counts.critical.count, 4);
        assert_eq!(counts.critical.states.get("down"), Some(&4));
        assert_eq!(counts.warn.count, 0);
        assert_eq!(counts.ok.count, 0);
    }

    #[test]
    fn test_pg_warn_before_ok() {
        let counts = pg_counters(&[pg_state("active+clean+scrubbing", 7)]);
        assert_eq!(counts.warn.count, 7);
        assert_eq!(counts.warn.states.get("scrubbing"), Some(&7));
        assert!(counts.ok.states.is_empty());
    }

    #[test]
    fn test_pg_ok_counts_each_label() {
        let counts = pg_counters(&[pg_state("active+clean", 100), pg_state("active", 3)]);
        assert_eq!(counts.ok.count, 103);
        assert_eq!(counts.ok.states.get("active"), Some(&103));
        assert_eq!(counts.ok.states.get("clean"), Some(&100));
    }

    #[test]
    fn test_pg_multiple_critical_labels() {
        let counts = pg_counters(&[pg_state("down+peering", 2)]);
        assert_eq!(counts.critical.count, 2);
        assert_eq!(counts.critical.states.get("down"), Some(&2));
        assert_eq!(counts.critical.states.get("peering"), Some(&2));
    }

    #[test]
    fn test_pg_unknown_state_contributes_nothing() {
        let counts = pg_counters(&[pg_state("unknown+snaptrim", 9)]);
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn test_osd_buckets() {
        let osds = vec![
            osd(true, true),
            osd(true, true),
            osd(true, false),
            osd(false, true),
            osd(false, false),
        ];
        let counts = osd_counters(&osds);
        assert_eq!(counts.ok.count, 2);
        assert_eq!(counts.warn.count, 2);
        assert_eq!(counts.critical.count, 1);
        assert_eq!(counts.warn.states.get("up/out"), Some(&1));
        assert_eq!(counts.warn.states.get("down/in"), Some(&1));
        assert_eq!(counts.critical.states.get("down/out"), Some(&1));
        assert_eq!(counts.total(), osds.len() as u64);
    }

    #[test]
    fn test_osd_zero_labels_omitted() {
        let counts = osd_counters(&[osd(true, true)]);
        assert!(counts.warn.states.is_empty());
        assert!(counts.critical.states.is_empty());
        assert_eq!(counts.ok.states.get("up/in"), Some(&1));
    }

    #[test]
    fn test_mds_counters() {
        let counts = mds_counters(&MdsMapSummary { max: 3, up: 2, in_: 1 });
        assert_eq!(counts.ok.count, 1);
        assert_eq!(counts.warn.count, 1);
        assert_eq!(counts.critical.count, 1);
        assert!(counts.ok.states.is_empty());
    }

    #[test]
    fn test_mds_counters_never_negative() {
        let counts = mds_counters(&MdsMapSummary { max: 0, up: 1, in_: 2 });
        assert_eq!(counts.warn.count, 0);
        assert_eq!(counts.critical.count, 0);
    }

    #[tokio::test]
    async fn test_mon_counters_quorum_probe_split() {
        let net = StaticNetwork::new().with_reachable("10.0.0.2:6789/0");
        let mons = vec![
            mon(0, "10.0.0.1:6789/0"),
            mon(1, "10.0.0.2:6789/0"),
            mon(2, "10.0.0.3:6789/0"),
        ];
        let counts = mon_counters(&mons, &[0], &net).await;
        assert_eq!(counts.ok.states.get("in"), Some(&1));
        assert_eq!(counts.warn.states.get("up"), Some(&1));
        assert_eq!(counts.critical.states.get("out"), Some(&1));
        // Quorum members are never probed.
        assert_eq!(net.probes(), 2);
    }

    #[test]
    fn test_pool_counters_clamp_and_filter() {
        let mut a = HashMap::new();
        a.insert("num_objects_degraded".to_string(), 50);
        a.insert("num_scrub_errors".to_string(), 0);
        a.insert("num_bytes".to_string(), 1 << 30);
        let mut b = HashMap::new();
        b.insert("num_objects_degraded".to_string(), 1);
        b.insert("num_objects_unfound".to_string(), 3);

        let counters = pool_counters(&[
            PoolPgStat { poolid: 0, stat_sum: a },
            PoolPgStat { poolid: 1, stat_sum: b },
        ]);
        assert_eq!(counters.total, 2);
        assert_eq!(counters.fields.get("num_objects_degraded"), Some(&2));
        assert_eq!(counters.fields.get("num_objects_unfound"), Some(&1));
        assert_eq!(counters.fields.get("num_scrub_errors"), Some(&0));
        assert!(!counters.fields.contains_key("num_bytes"));
        assert_eq!(counters.fields.len(), POOL_COUNTER_FIELDS.len());
    }
}
