//! Cluster-local service names and the namespace allow-list.
//!
//! Kubernetes publishes Services as `<service>.<namespace>.svc.<cluster-domain>`
//! and pods behind a headless Service as
//! `<pod>.<service>.<namespace>.svc.<cluster-domain>`. Both shapes end in the
//! same positions, so a service reference is read from the labels counted
//! from the end of the name.

use std::fmt;
use std::sync::Arc;

/// Label that marks a cluster-local Service name.
const SERVICE_LABEL: &str = "svc";

/// Minimum number of labels in a cluster-local Service name.
const MIN_LABELS: usize = 5;

/// A (namespace, service) pair extracted from a DNS query name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    /// Kubernetes namespace of the Service.
    pub namespace: String,
    /// Service name.
    pub service: String,
}

impl ServiceRef {
    /// Build a reference from its parts.
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    /// Parse a DNS query name into a service reference.
    ///
    /// A trailing dot is ignored. Returns `None` for names with fewer than five
    /// labels or whose third-from-last label is not `svc`. Label contents are
    /// not validated.
    pub fn parse(qname: &str) -> Option<Self> {
        let name = qname.strip_suffix('.').unwrap_or(qname);
        let labels: Vec<&str> = name.split('.').collect();
        let len = labels.len();

        if len < MIN_LABELS || labels[len - 3] != SERVICE_LABEL {
            return None;
        }

        Some(Self::new(labels[len - 4], labels[len - 5]))
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

/// Namespaces whose services are watched. Empty means every namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceAllowList {
    namespaces: Arc<[String]>,
}

impl NamespaceAllowList {
    /// Build an allow-list, keeping the configured order and dropping duplicates.
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for ns in namespaces {
            let ns = ns.into();
            if !list.contains(&ns) {
                list.push(ns);
            }
        }
        Self {
            namespaces: list.into(),
        }
    }

    /// True when the list watches every namespace.
    pub fn is_all(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Configured namespaces in order.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Exact, case-sensitive membership test.
    pub fn watches(&self, service: &ServiceRef) -> bool {
        self.is_all() || self.namespaces.iter().any(|ns| *ns == service.namespace)
    }
}
