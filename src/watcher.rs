//! Event stream consumer that keeps the service registry in sync with Docker
//!
//! A single task owns the subscription and applies events in feed order, so
//! a `die` can never overtake the `start` it follows. Per-event failures are
//! logged and skipped; only the loss of the feed itself ends a subscription.

use crate::config::EventsConfig;
use crate::error::FeedError;
use crate::events::{self, LifecycleClass, RoutingAction, RoutingEvent};
use crate::history::SharedHistory;
use crate::registry::{ServiceRecord, SharedRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bollard::models::{ContainerInspectResponse, EventMessage};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A running container as reported by a listing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub name: Option<String>,
}

/// The parts of a container runtime the watcher depends on
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Open a new subscription to the lifecycle event feed, replaying events
    /// that happened at or after `since` before streaming new ones
    fn subscribe(&self, since: DateTime<Utc>) -> BoxStream<'static, Result<EventMessage, FeedError>>;

    /// Fetch full details of a container by id or name
    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInspectResponse>;

    /// List the containers that are currently running
    async fn list_running(&self) -> anyhow::Result<Vec<RunningContainer>>;
}

/// Why a subscription stopped delivering events
#[derive(Debug)]
enum FeedEnd {
    Closed,
    Failed(FeedError),
    Shutdown,
}

pub struct EventWatcher<R: ContainerRuntime + ?Sized> {
    runtime: Arc<R>,
    registry: SharedRegistry,
    history: SharedHistory,
    config: EventsConfig,
}

impl<R: ContainerRuntime + ?Sized> EventWatcher<R> {
    pub fn new(
        runtime: Arc<R>,
        registry: SharedRegistry,
        history: SharedHistory,
        config: EventsConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            history,
            config,
        }
    }

    /// Decode one feed message into a routing transition.
    ///
    /// Every container-scoped action is recorded in the history, whether or
    /// not it turns out to be routable.
    pub async fn process(&self, message: &EventMessage) -> anyhow::Result<Option<RoutingEvent>> {
        let Some(event) = events::decode_event(message)? else {
            return Ok(None);
        };

        self.history.record(event.action.clone());

        match event.class() {
            LifecycleClass::Start => {
                let detail = self.runtime.inspect(&event.id).await?;
                let name = events::container_name(&detail)
                    .or(event.name)
                    .ok_or_else(|| anyhow::anyhow!("container {} has no name", event.id))?;
                Ok(Some(RoutingEvent::started(
                    name,
                    events::select_endpoint(&detail),
                )))
            }
            LifecycleClass::Stop => {
                let name = match event.name {
                    Some(name) => name,
                    None => {
                        let detail = self.runtime.inspect(&event.id).await?;
                        events::container_name(&detail).ok_or_else(|| {
                            anyhow::anyhow!("container {} has no name", event.id)
                        })?
                    }
                };
                Ok(Some(RoutingEvent::stopped(name)))
            }
            LifecycleClass::Other => {
                debug!(container_id = %event.id, action = %event.action, "Ignoring container event");
                Ok(None)
            }
        }
    }

    /// Apply a transition to the registry, logging the outcome
    pub fn apply(&self, event: RoutingEvent) {
        match &event.action {
            RoutingAction::Started {
                endpoint: Some(endpoint),
            } => {
                info!(service = %event.name, %endpoint, "Container started and registered");
            }
            RoutingAction::Started { endpoint: None } => {
                info!(service = %event.name, "Container started without exposed port or address, not routable");
            }
            RoutingAction::Stopped => {
                info!(service = %event.name, "Container stopped and unregistered");
            }
        }
        self.registry.apply(event);
    }

    /// Process and apply one message; failures are confined to that message
    pub async fn handle(&self, message: &EventMessage) {
        match self.process(message).await {
            Ok(Some(event)) => self.apply(event),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    action = message.action.as_deref().unwrap_or(""),
                    error = %e,
                    "Error processing Docker event, skipping"
                );
            }
        }
    }

    /// Rebuild the registry from the set of running containers.
    ///
    /// Running containers with a routable endpoint are upserted and records
    /// for containers that are no longer running are dropped. A container
    /// that cannot be inspected keeps whatever record it already had.
    pub async fn resync(&self) -> anyhow::Result<()> {
        let running = self.runtime.list_running().await?;
        let mut live = HashSet::new();
        let mut registered = 0usize;

        for container in running {
            match self.runtime.inspect(&container.id).await {
                Ok(detail) => {
                    let Some(name) = events::container_name(&detail).or(container.name) else {
                        continue;
                    };
                    let Some(endpoint) = events::select_endpoint(&detail) else {
                        debug!(service = %name, "Running container is not routable");
                        continue;
                    };
                    live.insert(name.clone());
                    let unchanged = self
                        .registry
                        .get(&name)
                        .is_some_and(|existing| existing.endpoint == endpoint);
                    if !unchanged {
                        self.registry.upsert(ServiceRecord::running(name, endpoint));
                    }
                    registered += 1;
                }
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "Failed to inspect running container");
                    if let Some(name) = container.name {
                        live.insert(name);
                    }
                }
            }
        }

        let before = self.registry.len();
        self.registry.retain(|record| live.contains(&record.name));
        let dropped = before.saturating_sub(self.registry.len());

        info!(registered, dropped, "Registry synchronized with running containers");
        Ok(())
    }

    /// Consume the event feed until shutdown.
    ///
    /// When the feed ends or fails the watcher resubscribes with exponential
    /// backoff, unless reconnecting is disabled, in which case it stops and
    /// the registry keeps its last state.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let initial = self.config.reconnect_initial();
        let max = self.config.reconnect_max();
        let mut backoff = initial;

        loop {
            // The subscription replays from here, so a change that lands while
            // the listing is in flight is still applied after it
            let since = Utc::now();
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Failed to list running containers");
            }

            let (end, received) = self.consume(since, &mut shutdown_rx).await;
            match end {
                FeedEnd::Shutdown => {
                    info!("Event watcher shutting down");
                    return;
                }
                FeedEnd::Closed => warn!("Docker event feed ended"),
                FeedEnd::Failed(e) => error!(error = %e, "Docker event feed failed"),
            }

            if !self.config.reconnect {
                error!("Event feed reconnect is disabled; container changes will no longer be routed until restart");
                return;
            }

            if received {
                backoff = initial;
            }

            info!(delay_ms = backoff.as_millis() as u64, "Reconnecting to Docker event feed");
            if wait_or_shutdown(backoff, &mut shutdown_rx).await {
                info!("Event watcher shutting down");
                return;
            }
            backoff = next_backoff(backoff, max);
        }
    }

    /// Drain one subscription. Returns how it ended and whether any event arrived.
    async fn consume(
        &self,
        since: DateTime<Utc>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> (FeedEnd, bool) {
        let mut stream = self.runtime.subscribe(since);
        let mut received = false;
        info!("Listening for Docker events");

        loop {
            tokio::select! {
                item = stream.next() => {
                    match item {
                        Some(Ok(message)) => {
                            received = true;
                            self.handle(&message).await;
                        }
                        Some(Err(FeedError::Decode(e))) => {
                            received = true;
                            warn!(error = %e, "Malformed Docker event, skipping");
                        }
                        Some(Err(e)) => return (FeedEnd::Failed(e), received),
                        None => return (FeedEnd::Closed, received),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return (FeedEnd::Shutdown, received);
                    }
                }
            }
        }
    }
}

/// Double the delay, capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile
async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}
