//! Speakercraft adapter
//!
//! Drives the zone entities: sets the platform up (a not-ready amplifier
//! fails the run so AdapterHandle retries it), polls every zone on a fixed
//! cadence, and dispatches commands coming from the HTTP API or the bus.
//! Zones are unloaded in `stop()`, which AdapterHandle calls after every run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{BusEvent, ZoneCommand};
use crate::config::StructuredConfig;
use crate::platform::{setup_platform, unload_platform, IntegrationContext};
use crate::zone::{CommandOutcome, PollOutcome, ZoneEntity, ZoneView};

pub const ADAPTER_NAME: &str = "speakercraft";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),
}

/// Apply one command to an entity.
pub async fn apply_command(entity: &mut ZoneEntity, command: ZoneCommand) -> CommandOutcome {
    match command {
        ZoneCommand::TurnOn => entity.turn_on().await,
        ZoneCommand::TurnOff => entity.turn_off().await,
        ZoneCommand::Mute { muted } => entity.mute_volume(muted).await,
        ZoneCommand::SetVolume { level } => entity.set_volume_level(level).await,
        ZoneCommand::VolumeUp => entity.volume_up().await,
        ZoneCommand::VolumeDown => entity.volume_down().await,
        ZoneCommand::SelectSource { source } => entity.select_source(&source).await,
        ZoneCommand::Snapshot => entity.snapshot().await,
        ZoneCommand::Restore => entity.restore().await,
    }
}

pub struct SpeakercraftAdapter {
    context: Arc<IntegrationContext>,
    layout: StructuredConfig,
    poll_interval: Duration,
}

impl SpeakercraftAdapter {
    pub fn new(
        context: Arc<IntegrationContext>,
        layout: StructuredConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            context,
            layout,
            poll_interval,
        }
    }

    pub fn context(&self) -> &Arc<IntegrationContext> {
        &self.context
    }

    pub fn layout(&self) -> &StructuredConfig {
        &self.layout
    }

    pub async fn zone_views(&self) -> Vec<ZoneView> {
        let zones = self.context.zones().await;
        let mut views = Vec::with_capacity(zones.len());
        for zone in zones {
            views.push(zone.entity.lock().await.view());
        }
        views
    }

    pub async fn zone_view(&self, zone_id: &str) -> Option<ZoneView> {
        let zone = self.context.find(zone_id).await?;
        let view = zone.entity.lock().await.view();
        Some(view)
    }

    /// Run a command against one zone. Holds the entity lock for the whole
    /// command, so it never overlaps a poll of the same zone.
    pub async fn execute(
        &self,
        zone_id: &str,
        command: ZoneCommand,
    ) -> Result<CommandOutcome, DispatchError> {
        let zone = self
            .context
            .find(zone_id)
            .await
            .ok_or_else(|| DispatchError::ZoneNotFound(zone_id.to_string()))?;

        let name = command.name();
        let mut entity = zone.entity.lock().await;
        let before = entity.cache();
        let outcome = apply_command(&mut entity, command).await;

        match outcome {
            CommandOutcome::Sent => debug!("{}: {} sent", zone.unique_id, name),
            CommandOutcome::Ignored(reason) => {
                info!("{}: {} ignored ({})", zone.unique_id, name, reason)
            }
        }

        if entity.cache() != before {
            self.context
                .bus()
                .publish(BusEvent::ZoneUpdated { zone: entity.view() });
        }
        Ok(outcome)
    }

    /// Poll every zone once. Returns how many polls succeeded.
    pub async fn poll_all(&self) -> usize {
        let zones = self.context.zones().await;
        let bus = self.context.bus();

        let polls = zones.iter().map(|zone| async move {
            let mut entity = zone.entity.lock().await;
            let before = entity.cache();
            let outcome = entity.update().await;
            if outcome == PollOutcome::Updated && entity.cache() != before {
                bus.publish(BusEvent::ZoneUpdated { zone: entity.view() });
            }
            outcome
        });

        join_all(polls)
            .await
            .into_iter()
            .filter(|o| *o == PollOutcome::Updated)
            .count()
    }
}

#[async_trait]
impl AdapterLogic for SpeakercraftAdapter {
    fn prefix(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        // Subscribe before setup so commands sent meanwhile are not lost
        let mut rx = ctx.bus.subscribe();

        setup_platform(&self.context, &self.layout).await?;

        let mut poll_timer = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling {} zones every {:?}",
            self.context.zone_count().await,
            self.poll_interval
        );

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    info!("Speakercraft polling shutting down");
                    break;
                }
                _ = poll_timer.tick() => {
                    let updated = self.poll_all().await;
                    debug!("Poll cycle: {} zones answered", updated);
                }
                event = rx.recv() => match event {
                    Ok(BusEvent::ControlCommand { zone_id, command }) => {
                        if let Err(e) = self.execute(&zone_id, command).await {
                            warn!("Control command dropped: {}", e);
                        }
                    }
                    Ok(BusEvent::ShuttingDown { .. }) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Speakercraft adapter lagged {} bus events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) {
        let removed = unload_platform(&self.context).await;
        if !removed.is_empty() {
            debug!("Unloaded {} zones on stop", removed.len());
        }
    }

    async fn handle_command(&self, zone_id: &str, command: ZoneCommand) -> Result<CommandOutcome> {
        Ok(self.execute(zone_id, command).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::client::{ClientCall, SimulatedConnector, ZoneStatus};
    use crate::config::{AmpConfig, Slot};
    use crate::zone::ZoneState;

    const PORT: &str = "/dev/ttyUSB0";

    fn adapter(connector: Arc<SimulatedConnector>) -> SpeakercraftAdapter {
        let context = Arc::new(IntegrationContext::new(create_bus(), connector));
        let layout = StructuredConfig {
            amps: vec![AmpConfig {
                port: PORT.to_string(),
                sources: vec![Slot::new(0, "CD"), Slot::new(1, "Tuner")],
                zones: vec![Slot::new(0, "Kitchen"), Slot::new(1, "Patio")],
            }],
        };
        SpeakercraftAdapter::new(context, layout, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_execute_unknown_zone() {
        let adapter = adapter(Arc::new(SimulatedConnector::new(6)));
        let err = adapter
            .execute("speakercraft_nowhere_0", ZoneCommand::TurnOn)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ZoneNotFound(_)));

        let err = adapter
            .handle_command("speakercraft_nowhere_0", ZoneCommand::TurnOn)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<DispatchError>().is_some());
    }

    #[tokio::test]
    async fn test_command_then_poll_observes_effect() {
        let connector = Arc::new(SimulatedConnector::new(6));
        let adapter = adapter(connector.clone());
        setup_platform(adapter.context(), adapter.layout())
            .await
            .unwrap();

        let id = "speakercraft_/dev/ttyUSB0_1";
        let outcome = adapter.execute(id, ZoneCommand::TurnOn).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Sent);

        // Commands do not touch the cache
        assert_eq!(adapter.zone_view(id).await.unwrap().state, ZoneState::Off);

        assert_eq!(adapter.poll_all().await, 2);
        assert_eq!(adapter.zone_view(id).await.unwrap().state, ZoneState::On);

        let amp = connector.amplifier(PORT).unwrap();
        assert!(amp.commands().contains(&ClientCall::SetPower(1, true)));
    }

    #[tokio::test]
    async fn test_restore_publishes_update() {
        let connector = Arc::new(SimulatedConnector::new(6));
        let adapter = adapter(connector.clone());
        setup_platform(adapter.context(), adapter.layout())
            .await
            .unwrap();
        let mut rx = adapter.context().bus().subscribe();

        let id = "speakercraft_/dev/ttyUSB0_0";
        adapter.execute(id, ZoneCommand::Snapshot).await.unwrap();

        let amp = connector.amplifier(PORT).unwrap();
        amp.set_zone(ZoneStatus {
            zone: 0,
            power: true,
            volume: 80,
            mute: true,
            source: 1,
        });
        adapter.poll_all().await;
        assert_eq!(adapter.zone_view(id).await.unwrap().volume_level, Some(0.8));

        let outcome = adapter.execute(id, ZoneCommand::Restore).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Sent);
        assert_eq!(adapter.zone_view(id).await.unwrap().volume_level, Some(0.2));

        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BusEvent::ZoneUpdated { .. }) {
                updates += 1;
            }
        }
        // one from the poll, one from the restore refresh
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_stop_unloads_zones() {
        let adapter = adapter(Arc::new(SimulatedConnector::new(6)));
        setup_platform(adapter.context(), adapter.layout())
            .await
            .unwrap();

        adapter.stop().await;
        assert_eq!(adapter.context().zone_count().await, 0);

        // Idempotent after a run that never registered anything
        adapter.stop().await;
        assert_eq!(adapter.context().zone_count().await, 0);
    }

    #[tokio::test]
    async fn test_poll_without_change_publishes_nothing() {
        let adapter = adapter(Arc::new(SimulatedConnector::new(6)));
        setup_platform(adapter.context(), adapter.layout())
            .await
            .unwrap();
        let mut rx = adapter.context().bus().subscribe();

        assert_eq!(adapter.poll_all().await, 2);
        assert!(rx.try_recv().is_err());
    }
}
