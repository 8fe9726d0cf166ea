//! In-memory routing table of running services
//!
//! The registry maps a service name to the endpoint of its container. It is
//! written by the event watcher only and read by every proxied request, so it
//! is backed by a sharded concurrent map: a record is replaced as a whole under
//! its shard lock and readers get a cloned, fully-written record.

use crate::events::{RoutingAction, RoutingEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Network endpoint a service resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Base URL used when forwarding to this endpoint
    pub fn url(&self) -> String {
        format!("http://{}", self.socket_addr())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Status of a registered service. Stopped services are removed, never marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
}

/// A currently routable service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    /// Container name, without the leading slash Docker reports
    pub name: String,
    pub endpoint: Endpoint,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn running(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            status: ServiceStatus::Running,
            registered_at: Utc::now(),
        }
    }
}

/// Concurrent service name -> endpoint table
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceRecord>,
}

/// Wrapper to share the registry across tasks
pub type SharedRegistry = Arc<ServiceRegistry>;

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or wholesale replace the record for `record.name`
    pub fn upsert(&self, record: ServiceRecord) {
        if let Some(previous) = self.services.insert(record.name.clone(), record.clone()) {
            if previous.endpoint != record.endpoint {
                info!(
                    service = %record.name,
                    old = %previous.endpoint,
                    new = %record.endpoint,
                    "Service endpoint replaced"
                );
                return;
            }
        }
        debug!(service = %record.name, endpoint = %record.endpoint, "Service upserted");
    }

    /// Remove the service with exactly this container name. Removing an
    /// unknown name is a no-op.
    pub fn remove(&self, name: &str) -> Option<ServiceRecord> {
        self.services.remove(name).map(|(_, record)| record)
    }

    /// Exact container name only
    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Resolve a host label to a service.
    ///
    /// Container names are case-sensitive but host names are not: an exact
    /// match wins, otherwise the alphabetically first name equal to `label`
    /// ignoring ASCII case.
    pub fn lookup(&self, label: &str) -> Option<ServiceRecord> {
        if let Some(record) = self.get(label) {
            return Some(record);
        }
        self.services
            .iter()
            .filter(|entry| entry.key().eq_ignore_ascii_case(label))
            .map(|entry| entry.value().clone())
            .min_by(|a, b| a.name.cmp(&b.name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// All records at call time, sorted by name
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self
            .services
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Keep only the services for which `keep` returns true
    pub fn retain(&self, mut keep: impl FnMut(&ServiceRecord) -> bool) {
        self.services.retain(|_, record| keep(record));
    }

    /// Apply one decoded lifecycle transition
    pub fn apply(&self, event: RoutingEvent) {
        match event.action {
            RoutingAction::Started {
                endpoint: Some(endpoint),
            } => {
                self.upsert(ServiceRecord::running(event.name, endpoint));
            }
            RoutingAction::Started { endpoint: None } => {
                debug!(service = %event.name, "Started without a routable endpoint, not registering");
            }
            RoutingAction::Stopped => {
                if self.remove(&event.name).is_some() {
                    debug!(service = %event.name, "Service removed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(last_octet: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint(5, 9000).url(), "http://10.0.0.5:9000");
        let v6 = Endpoint::new("fd00::2".parse().unwrap(), 80);
        assert_eq!(v6.url(), "http://[fd00::2]:80");
        assert_eq!(v6.to_string(), "[fd00::2]:80");
    }

    #[test]
    fn test_upsert_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("foo", endpoint(5, 9000)));

        let record = registry.lookup("foo").unwrap();
        assert_eq!(record.endpoint, endpoint(5, 9000));
        assert_eq!(record.status, ServiceStatus::Running);
        assert!(registry.lookup("bar").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("foo", endpoint(5, 9000)));
        registry.upsert(ServiceRecord::running("foo", endpoint(6, 9001)));

        assert_eq!(registry.lookup("foo").unwrap().endpoint, endpoint(6, 9001));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ServiceRegistry::new();
        assert!(registry.remove("ghost").is_none());
        assert!(registry.is_empty());

        registry.upsert(ServiceRecord::running("foo", endpoint(5, 9000)));
        assert!(registry.remove("foo").is_some());
        assert!(registry.remove("foo").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_falls_back_to_case_insensitive_match() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("MyApp", endpoint(5, 9000)));

        let record = registry.lookup("myapp").unwrap();
        assert_eq!(record.name, "MyApp");
        assert!(registry.get("myapp").is_none());
        assert!(!registry.contains("MYAPP"));

        // Writes and removals use the exact container name
        assert!(registry.remove("myapp").is_none());
        assert!(registry.remove("MyApp").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_differing_only_in_case_are_distinct() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("Web", endpoint(1, 80)));
        registry.upsert(ServiceRecord::running("web", endpoint(2, 80)));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.lookup("web").unwrap().endpoint, endpoint(2, 80));
        assert_eq!(registry.lookup("Web").unwrap().endpoint, endpoint(1, 80));
        // No exact match: the alphabetically first spelling ("Web" < "web")
        assert_eq!(registry.lookup("WEB").unwrap().endpoint, endpoint(1, 80));

        registry.apply(RoutingEvent::stopped("Web"));
        assert_eq!(registry.lookup("web").unwrap().endpoint, endpoint(2, 80));
        assert_eq!(registry.lookup("WEB").unwrap().endpoint, endpoint(2, 80));
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("web", endpoint(3, 80)));
        registry.upsert(ServiceRecord::running("api", endpoint(4, 8080)));
        registry.upsert(ServiceRecord::running("db-admin", endpoint(5, 8081)));

        let names: Vec<String> = registry.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["api", "db-admin", "web"]);
    }

    #[test]
    fn test_retain() {
        let registry = ServiceRegistry::new();
        registry.upsert(ServiceRecord::running("keep", endpoint(3, 80)));
        registry.upsert(ServiceRecord::running("drop", endpoint(4, 80)));

        registry.retain(|record| record.name == "keep");
        assert!(registry.contains("keep"));
        assert!(!registry.contains("drop"));
    }

    #[test]
    fn test_apply_events() {
        let registry = ServiceRegistry::new();

        registry.apply(RoutingEvent::started("foo", Some(endpoint(5, 9000))));
        assert_eq!(registry.lookup("foo").unwrap().endpoint, endpoint(5, 9000));

        registry.apply(RoutingEvent::started("noport", None));
        assert!(registry.lookup("noport").is_none());

        registry.apply(RoutingEvent::stopped("foo"));
        assert!(registry.lookup("foo").is_none());

        registry.apply(RoutingEvent::stopped("foo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_serializes() {
        let record = ServiceRecord::running("foo", endpoint(5, 9000));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "foo");
        assert_eq!(json["status"], "running");
        assert_eq!(json["endpoint"]["address"], "10.0.0.5");
        assert_eq!(json["endpoint"]["port"], 9000);
    }
}
