use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;
use url::Host;

/// Domain blocklist/allowlist plus the private-address guard
pub struct DomainPolicy {
    blocked_domains: HashSet<String>,
    allowed_domains: HashSet<String>,
    allow_private_addresses: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainVerdict {
    Allowed,
    Blocked,
    NotAllowListed,
    PrivateAddress,
}

impl DomainPolicy {
    pub fn new(blocked: &[String], allowed: &[String], allow_private_addresses: bool) -> Self {
        Self {
            blocked_domains: blocked.iter().map(|d| normalize_domain(d)).collect(),
            allowed_domains: allowed.iter().map(|d| normalize_domain(d)).collect(),
            allow_private_addresses,
        }
    }

    pub fn check(&self, host: &Host<&str>) -> DomainVerdict {
        let name = match host {
            Host::Domain(d) => normalize_domain(d),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        debug!("Checking domain policy for {}", name);

        if matches_any(&self.blocked_domains, &name) {
            return DomainVerdict::Blocked;
        }
        if !self.allow_private_addresses && is_internal_host(host) {
            return DomainVerdict::PrivateAddress;
        }
        if !self.allowed_domains.is_empty() && !matches_any(&self.allowed_domains, &name) {
            return DomainVerdict::NotAllowListed;
        }
        DomainVerdict::Allowed
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        matches_any(&self.blocked_domains, &normalize_domain(domain))
    }
}

/// Exact or subdomain match
fn matches_any(set: &HashSet<String>, name: &str) -> bool {
    set.contains(name) || set.iter().any(|d| name.ends_with(&format!(".{}", d)))
}

fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().trim_end_matches('.').to_lowercase();
    lower.strip_prefix("www.").map(str::to_string).unwrap_or(lower)
}

/// Loopback, private, link-local and unspecified addresses, plus local host names
pub fn is_internal_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(d) => {
            let d = d.to_lowercase();
            d == "localhost" || d.ends_with(".localhost") || d.ends_with(".local") || d.ends_with(".internal")
        }
        Host::Ipv4(ip) => is_internal_v4(ip),
        Host::Ipv6(ip) => is_internal_v6(ip),
    }
}

fn is_internal_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_internal_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}
