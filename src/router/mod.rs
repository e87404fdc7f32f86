//! Cluster routing: the backend directory and the user-name convention that
//! selects a cluster.

use std::str::FromStr;

/// Port appended to backend addresses that do not carry one.
pub const DEFAULT_BACKEND_PORT: u16 = 4000;

/// One `clusterID=address` registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEntry {
    pub cluster_id: String,
    pub address: String,
}

impl FromStr for BackendEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((cluster_id, address)) if !cluster_id.is_empty() && !address.is_empty() => {
                Ok(Self {
                    cluster_id: cluster_id.to_string(),
                    address: address.to_string(),
                })
            }
            _ => Err("backend must be in the form of clusterID=address".to_string()),
        }
    }
}

/// Immutable cluster-id to address map, built once at startup.
#[derive(Debug, Default)]
pub struct BackendDirectory {
    entries: Vec<BackendEntry>,
}

impl BackendDirectory {
    pub fn new(entries: Vec<BackendEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `cluster_id` (ASCII case-insensitive). An unknown id is
    /// returned unchanged and treated as a literal address downstream.
    pub fn find(&self, cluster_id: &str) -> String {
        self.entries
            .iter()
            .find(|e| e.cluster_id.eq_ignore_ascii_case(cluster_id))
            .map(|e| e.address.clone())
            .unwrap_or_else(|| cluster_id.to_string())
    }

    /// Resolve a cluster id to a dialable address, applying the port
    /// default.
    pub fn resolve(&self, cluster_id: &str) -> String {
        ensure_port(self.find(cluster_id))
    }
}

/// Split a wire user name into `(cluster_id, real_user)` at the first `.`.
/// A name without a dot is all cluster id.
pub fn split_user_name(user_name: &str) -> (&str, &str) {
    match user_name.split_once('.') {
        Some((cluster_id, rest)) => (cluster_id, rest),
        None => (user_name, ""),
    }
}

/// Append the default port unless the address already ends in `:<digits>`.
pub fn ensure_port(addr: String) -> String {
    let has_port = addr
        .rsplit_once(':')
        .map(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);
    if has_port {
        addr
    } else {
        format!("{addr}:{DEFAULT_BACKEND_PORT}")
    }
}
