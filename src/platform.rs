//! Platform setup - builds zone entities from the amplifier layout
//!
//! [`IntegrationContext`] owns everything the integration shares: the bus,
//! the connector used to reach amplifiers, and the registry of live zone
//! entities. It is created once and passed to every component.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::client::{AmplifierConnector, ClientError, SharedClient};
use crate::config::StructuredConfig;
use crate::zone::{PollOutcome, ZoneEntity};

#[derive(Debug, Error)]
pub enum SetupError {
    /// The amplifier could not be reached; the whole setup should be retried
    #[error("amplifier on {port} not ready: {source}")]
    NotReady {
        port: String,
        #[source]
        source: ClientError,
    },
    #[error("client acquisition for {port} did not complete: {reason}")]
    Worker { port: String, reason: String },
}

/// A registered zone entity. The mutex gives each entity at most one
/// in-flight poll or command.
#[derive(Clone)]
pub struct RegisteredZone {
    pub unique_id: String,
    pub object_id: String,
    pub entity: Arc<Mutex<ZoneEntity>>,
}

impl RegisteredZone {
    pub fn new(entity: ZoneEntity) -> Self {
        Self {
            unique_id: entity.unique_id().to_string(),
            object_id: entity.object_id(),
            entity: Arc::new(Mutex::new(entity)),
        }
    }

    pub fn matches(&self, zone_id: &str) -> bool {
        self.unique_id == zone_id || self.object_id == zone_id
    }
}

pub struct IntegrationContext {
    bus: SharedBus,
    connector: Arc<dyn AmplifierConnector>,
    zones: RwLock<Vec<RegisteredZone>>,
}

impl IntegrationContext {
    pub fn new(bus: SharedBus, connector: Arc<dyn AmplifierConnector>) -> Self {
        Self {
            bus,
            connector,
            zones: RwLock::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Registered zones in registration order
    pub async fn zones(&self) -> Vec<RegisteredZone> {
        self.zones.read().await.clone()
    }

    /// Look up a zone by unique id or object id
    pub async fn find(&self, zone_id: &str) -> Option<RegisteredZone> {
        self.zones
            .read()
            .await
            .iter()
            .find(|z| z.matches(zone_id))
            .cloned()
    }

    pub async fn zone_count(&self) -> usize {
        self.zones.read().await.len()
    }

    /// Register zones, replacing any already registered under the same id
    async fn register(&self, new_zones: &[RegisteredZone]) {
        let mut zones = self.zones.write().await;
        zones.retain(|z| !new_zones.iter().any(|n| n.unique_id == z.unique_id));
        zones.extend(new_zones.iter().cloned());
    }

    async fn take_all(&self) -> Vec<RegisteredZone> {
        std::mem::take(&mut *self.zones.write().await)
    }

    async fn acquire(&self, port: &str) -> Result<SharedClient, SetupError> {
        let connector = self.connector.clone();
        let owned_port = port.to_string();
        match tokio::task::spawn_blocking(move || connector.acquire(&owned_port)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(source)) => Err(SetupError::NotReady {
                port: port.to_string(),
                source,
            }),
            Err(e) => Err(SetupError::Worker {
                port: port.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Create one entity per configured zone and register them all.
///
/// Clients are acquired on the blocking pool. If any amplifier cannot be
/// reached nothing is registered. Once registered, every entity gets an
/// initial refresh before `ZoneDiscovered` is published for it.
///
/// Returns the number of registered zones.
pub async fn setup_platform(
    ctx: &IntegrationContext,
    layout: &StructuredConfig,
) -> Result<usize, SetupError> {
    let mut entities = Vec::new();

    for amp in &layout.amps {
        let client = match ctx.acquire(&amp.port).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Error connecting to Speakercraft controller: {}", e);
                ctx.bus.publish(BusEvent::AmplifierUnavailable {
                    port: amp.port.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        ctx.bus.publish(BusEvent::AmplifierConnected {
            port: amp.port.clone(),
        });

        let sources = amp.source_names();
        for (zone_index, zone) in amp.zones.iter().enumerate() {
            info!("Adding zone {} for port {}", zone.name, amp.port);
            entities.push(RegisteredZone::new(ZoneEntity::new(
                Some(client.clone()),
                sources.clone(),
                amp.port.clone(),
                zone_index,
                zone.name.clone(),
            )));
        }
    }

    ctx.register(&entities).await;

    let refreshes = entities.iter().map(|zone| async move {
        let mut entity = zone.entity.lock().await;
        if entity.update().await != PollOutcome::Updated {
            debug!("Initial refresh of {} returned no status", zone.unique_id);
        }
        entity.view()
    });
    for view in join_all(refreshes).await {
        ctx.bus.publish(BusEvent::ZoneDiscovered { zone: view });
    }

    info!("Registered {} zones", entities.len());
    Ok(entities.len())
}

/// Remove every registered zone. Returns the removed unique ids.
pub async fn unload_platform(ctx: &IntegrationContext) -> Vec<String> {
    let removed = ctx.take_all().await;
    for zone in &removed {
        ctx.bus.publish(BusEvent::ZoneRemoved {
            unique_id: zone.unique_id.clone(),
            object_id: zone.object_id.clone(),
        });
    }
    info!("Unloaded {} zones", removed.len());
    removed.into_iter().map(|z| z.unique_id).collect()
}
