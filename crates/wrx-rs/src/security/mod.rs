use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;
use tracing::debug;
use url::Url;

/// Extracts the bare host from a seed entry that may or may not carry a scheme.
pub fn host_of(target: &str) -> Option<String> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("http://{trimmed}")).ok()
    };
    parsed
        .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}

/// An empty allowlist admits everything.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let Some(host) = host_of(target) else {
        return false;
    };

    if allowlist.iter().any(|item| {
        let item = item.trim();
        item.eq_ignore_ascii_case(&host)
            || item
                .strip_prefix("*.")
                .is_some_and(|suffix| host.ends_with(&format!(".{}", suffix.to_ascii_lowercase())))
    }) {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(&host) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry.trim())
                .map(|net| net.contains(&ip))
                .unwrap_or(false)
        });
    }

    false
}

/// Literal loopback check: `localhost`, `*.localhost`, or a loopback IP.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim().trim_matches(['[', ']']).to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    IpAddr::from_str(&host)
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// True when the seed resolves only to loopback addresses.
///
/// Names that fail to resolve are treated as non-local.
pub async fn is_local_target(target: &str) -> bool {
    let Some(host) = host_of(target) else {
        return false;
    };
    if is_loopback_host(&host) {
        return true;
    }
    let local = match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            !addrs.is_empty() && addrs.iter().all(|a| a.ip().is_loopback())
        }
        Err(e) => {
            debug!(%host, error = %e, "lookup failed; treating as non-local");
            false
        }
    };
    local
}
