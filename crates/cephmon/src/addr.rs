//! Parsing of Ceph `entity_addr_t` strings (`ip:port/nonce`, `[ip]:port/nonce`).

use regex::Regex;
use std::sync::OnceLock;

/// Addresses meaning "no address configured"; never probed.
pub const MON_ADDR_IGNORES: [&str; 3] = ["0.0.0.0", "0:0:0:0:0:0:0:0", "::"];

static IPV4_RE: OnceLock<Regex> = OnceLock::new();
static IPV6_RE: OnceLock<Regex> = OnceLock::new();

fn ipv4_re() -> &'static Regex {
    IPV4_RE.get_or_init(|| {
        Regex::new(r"^(?P<addr>\d+\.\d+\.\d+\.\d+):(?P<port>\d+)/").expect("valid IPv4 pattern")
    })
}

fn ipv6_re() -> &'static Regex {
    IPV6_RE.get_or_init(|| Regex::new(r"^\[(?P<addr>\S+)\]:(?P<port>\d+)/").expect("valid IPv6 pattern"))
}

/// Strips port, nonce and IPv6 brackets, leaving the bare IP.
pub fn short_address(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    }
}

/// Host and port of a monitor address, if it matches either serialization.
pub fn parse_mon_addr(raw: &str) -> Option<(String, u16)> {
    let caps = ipv4_re()
        .captures(raw)
        .or_else(|| ipv6_re().captures(raw))?;
    let addr = caps.name("addr")?.as_str().to_string();
    let port = caps.name("port")?.as_str().parse().ok()?;
    Some((addr, port))
}

pub fn is_ignored_mon_addr(host: &str) -> bool {
    MON_ADDR_IGNORES.contains(&host)
}
