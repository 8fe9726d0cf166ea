//! Decoding of Docker lifecycle events into routing transitions
//!
//! Everything here is pure: it looks at bollard models and decides what a
//! raw event means for the routing table. The watcher owns the I/O.

use crate::error::FeedError;
use crate::registry::Endpoint;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use std::net::IpAddr;

/// Name of Docker's default network, preferred when picking an address
pub const DEFAULT_BRIDGE_NETWORK: &str = "bridge";

/// A container-scoped event as it arrives from the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// Container id, resolvable through inspect
    pub id: String,
    /// Container name from the event attributes, when Docker supplied it
    pub name: Option<String>,
    /// Raw action string, e.g. "start", "die", "exec_start: sh"
    pub action: String,
}

/// What a raw action means for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleClass {
    /// The container is now running and may become routable
    Start,
    /// The container is no longer running
    Stop,
    /// Anything else; recorded for statistics only
    Other,
}

impl ContainerEvent {
    pub fn class(&self) -> LifecycleClass {
        classify_action(&self.action)
    }
}

/// Map a Docker action string onto a lifecycle class.
///
/// `kill` is deliberately not a stop: a container can survive a signal and a
/// real exit is always followed by `die`.
pub fn classify_action(action: &str) -> LifecycleClass {
    match action {
        "start" => LifecycleClass::Start,
        "stop" | "die" => LifecycleClass::Stop,
        _ => LifecycleClass::Other,
    }
}

/// A decoded transition, consumed once by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEvent {
    pub name: String,
    pub action: RoutingAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingAction {
    /// Started; `endpoint` is `None` when no address or port could be resolved
    Started { endpoint: Option<Endpoint> },
    Stopped,
}

impl RoutingEvent {
    pub fn started(name: impl Into<String>, endpoint: Option<Endpoint>) -> Self {
        Self {
            name: name.into(),
            action: RoutingAction::Started { endpoint },
        }
    }

    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: RoutingAction::Stopped,
        }
    }
}

/// Filter a raw feed message down to a container event.
///
/// Returns `Ok(None)` for events of any other type and an error for
/// container events that lack an action or an actor id.
pub fn decode_event(message: &EventMessage) -> Result<Option<ContainerEvent>, FeedError> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return Ok(None);
    }

    let action = message
        .action
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| FeedError::Decode("container event without action".to_string()))?;

    let actor = message
        .actor
        .as_ref()
        .ok_or_else(|| FeedError::Decode(format!("'{}' event without actor", action)))?;

    let id = actor
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FeedError::Decode(format!("'{}' event without container id", action)))?;

    let name = actor
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get("name"))
        .map(|n| n.trim_start_matches('/'))
        .filter(|n| !n.is_empty())
        .map(String::from);

    Ok(Some(ContainerEvent {
        id: id.to_string(),
        name,
        action: action.to_string(),
    }))
}

/// Container name without Docker's leading slash
pub fn container_name(detail: &ContainerInspectResponse) -> Option<String> {
    detail
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/'))
        .filter(|n| !n.is_empty())
        .map(String::from)
}

fn parse_address(raw: Option<&String>) -> Option<IpAddr> {
    raw.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Address policy: the default bridge network's address, else the primary address
pub fn select_address(detail: &ContainerInspectResponse) -> Option<IpAddr> {
    let settings = detail.network_settings.as_ref()?;

    let bridge = settings
        .networks
        .as_ref()
        .and_then(|networks| networks.get(DEFAULT_BRIDGE_NETWORK))
        .and_then(|net| parse_address(net.ip_address.as_ref()));

    bridge.or_else(|| parse_address(settings.ip_address.as_ref()))
}

/// Port policy: the first usable exposed-port key in the daemon's own order.
///
/// Docker serializes `ExposedPorts` with sorted keys, so this is the
/// lexicographically smallest key: "10000/tcp" comes before "9000/tcp".
pub fn select_port(detail: &ContainerInspectResponse) -> Option<u16> {
    let mut keys: Vec<&String> = detail
        .config
        .as_ref()?
        .exposed_ports
        .as_ref()?
        .keys()
        .collect();
    keys.sort();
    keys.into_iter().find_map(|key| parse_exposed_port(key))
}

/// Parse an exposed-port key such as "8080/tcp" or "53"
pub fn parse_exposed_port(key: &str) -> Option<u16> {
    let port = key.split('/').next()?.trim();
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Resolve the endpoint a started container should be routed to
pub fn select_endpoint(detail: &ContainerInspectResponse) -> Option<Endpoint> {
    let address = select_address(detail)?;
    let port = select_port(detail)?;
    Some(Endpoint::new(address, port))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_classify_action() {
        assert_eq!(classify_action("start"), LifecycleClass::Start);
        assert_eq!(classify_action("stop"), LifecycleClass::Stop);
        assert_eq!(classify_action("die"), LifecycleClass::Stop);
        assert_eq!(classify_action("kill"), LifecycleClass::Other);
        assert_eq!(classify_action("exec_start: sh"), LifecycleClass::Other);
        assert_eq!(classify_action("create"), LifecycleClass::Other);
    }

    #[test]
    fn test_decode_container_event() {
        let message = container_event("start", "web");
        let event = decode_event(&message).unwrap().unwrap();

        assert_eq!(event.id, "web-id");
        assert_eq!(event.name.as_deref(), Some("web"));
        assert_eq!(event.action, "start");
        assert_eq!(event.class(), LifecycleClass::Start);
    }

    #[test]
    fn test_decode_ignores_other_types() {
        let message = event(EventMessageTypeEnum::NETWORK, "connect", "net-id", None);
        assert_eq!(decode_event(&message).unwrap(), None);

        let message = event(EventMessageTypeEnum::IMAGE, "pull", "img", None);
        assert_eq!(decode_event(&message).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_container_events() {
        let mut message = container_event("start", "web");
        message.actor = None;
        assert!(matches!(decode_event(&message), Err(FeedError::Decode(_))));

        let mut message = container_event("start", "web");
        message.action = None;
        assert!(matches!(decode_event(&message), Err(FeedError::Decode(_))));

        let message = event(EventMessageTypeEnum::CONTAINER, "die", "", Some("web"));
        assert!(matches!(decode_event(&message), Err(FeedError::Decode(_))));
    }

    #[test]
    fn test_decode_without_name_attribute() {
        let message = event(EventMessageTypeEnum::CONTAINER, "die", "abc123", None);
        let event = decode_event(&message).unwrap().unwrap();
        assert_eq!(event.name, None);
        assert_eq!(event.id, "abc123");
    }

    #[test]
    fn test_container_name_strips_slash() {
        let detail = container("api", Some("172.17.0.2"), &["80/tcp"]);
        assert_eq!(container_name(&detail).as_deref(), Some("api"));

        let mut detail = container("api", None, &[]);
        detail.name = Some("/".to_string());
        assert_eq!(container_name(&detail), None);
    }

    #[test]
    fn test_select_endpoint_prefers_bridge() {
        let mut detail = container("api", Some("172.17.0.2"), &["8080/tcp"]);
        if let Some(settings) = detail.network_settings.as_mut() {
            settings.ip_address = Some("10.1.2.3".to_string());
        }

        let endpoint = select_endpoint(&detail).unwrap();
        assert_eq!(endpoint.address, IpAddr::V4(Ipv4Addr::new(172, 17, 0, 2)));
        assert_eq!(endpoint.port, 8080);
    }

    #[test]
    fn test_select_endpoint_falls_back_to_primary_address() {
        let mut detail = container("api", None, &["3000/tcp"]);
        if let Some(settings) = detail.network_settings.as_mut() {
            settings.ip_address = Some("10.1.2.3".to_string());
        }
        assert_eq!(select_endpoint(&detail).unwrap().to_string(), "10.1.2.3:3000");

        // An empty bridge address also falls through to the primary address
        let mut detail = container("api", Some(""), &["3000/tcp"]);
        if let Some(settings) = detail.network_settings.as_mut() {
            settings.ip_address = Some("10.1.2.3".to_string());
        }
        assert_eq!(select_endpoint(&detail).unwrap().to_string(), "10.1.2.3:3000");
    }

    #[test]
    fn test_select_endpoint_requires_address() {
        let detail = container("api", None, &["3000/tcp"]);
        assert!(select_endpoint(&detail).is_none());

        let detail = container("api", Some("not-an-ip"), &["3000/tcp"]);
        assert!(select_endpoint(&detail).is_none());
    }

    #[test]
    fn test_select_endpoint_requires_port() {
        let detail = container("worker", Some("172.17.0.4"), &[]);
        assert!(select_port(&detail).is_none());
        assert!(select_endpoint(&detail).is_none());
    }

    #[test]
    fn test_select_port_follows_sorted_key_order() {
        let detail = container("multi", Some("172.17.0.4"), &["9090/tcp", "443/tcp", "8080/udp"]);
        assert_eq!(select_port(&detail), Some(443));

        let detail = container("wide", Some("172.17.0.4"), &["9000/tcp", "10000/tcp"]);
        assert_eq!(select_port(&detail), Some(10000));

        // Unusable keys are skipped rather than making the container unroutable
        let detail = container("odd", Some("172.17.0.4"), &["0/tcp", "abc/tcp", "8080/tcp"]);
        assert_eq!(select_port(&detail), Some(8080));
    }

    #[test]
    fn test_parse_exposed_port() {
        assert_eq!(parse_exposed_port("8080/tcp"), Some(8080));
        assert_eq!(parse_exposed_port("53/udp"), Some(53));
        assert_eq!(parse_exposed_port("80"), Some(80));
        assert_eq!(parse_exposed_port("0/tcp"), None);
        assert_eq!(parse_exposed_port("70000/tcp"), None);
        assert_eq!(parse_exposed_port("http/tcp"), None);
    }
}
