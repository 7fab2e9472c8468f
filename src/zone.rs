//! Zone entity - one controllable output of one amplifier
//!
//! The entity caches the last polled zone status. Commands are forwarded to
//! the amplifier client and never touch the cache: the effect of a command is
//! only observed through the next poll. The one exception is `restore`, which
//! refreshes immediately after sending the snapshot back.
//!
//! Every client call is blocking device I/O and runs on tokio's blocking pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{AmplifierClient, SharedClient, ZoneStatus, MAX_VOLUME};

pub const DOMAIN: &str = "mzc66";
pub const MANUFACTURER: &str = "Speakercraft";
pub const MODEL: &str = "Zone Amplifier";

/// Zones above this index start disabled in Home Assistant.
const LAST_ENABLED_BY_DEFAULT_ZONE: usize = 6;

/// Power state as exposed to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    On,
    Off,
    /// No successful poll yet
    #[default]
    Unknown,
}

impl std::fmt::Display for ZoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    TurnOn,
    TurnOff,
    VolumeSet,
    VolumeStep,
    VolumeMute,
    SelectSource,
}

pub const SUPPORTED_FEATURES: &[Feature] = &[
    Feature::VolumeMute,
    Feature::VolumeSet,
    Feature::VolumeStep,
    Feature::TurnOn,
    Feature::TurnOff,
    Feature::SelectSource,
];

/// Result of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// All cached fields were replaced from one status read
    Updated,
    /// No client bound; cache untouched
    NoClient,
    /// Client returned no status; cache untouched
    NoStatus,
}

/// Why a command did not reach the amplifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NoClient,
    /// Requested source name is not in the zone's source list
    UnknownSource,
    /// Relative volume change before the first successful poll
    VolumeUnknown,
    /// Restore without a held snapshot
    NoSnapshot,
    /// Snapshot read returned nothing
    NoStatus,
    /// The blocking worker running the client call died
    WorkerFailed,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoClient => "no amplifier client bound",
            Self::UnknownSource => "unknown source",
            Self::VolumeUnknown => "volume not known yet",
            Self::NoSnapshot => "no snapshot held",
            Self::NoStatus => "amplifier returned no status",
            Self::WorkerFailed => "client worker failed",
        };
        f.write_str(s)
    }
}

/// Result of an entity command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent,
    Ignored(IgnoreReason),
}

impl CommandOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }

    pub fn ignored_reason(&self) -> Option<IgnoreReason> {
        match self {
            Self::Sent => None,
            Self::Ignored(reason) => Some(*reason),
        }
    }
}

/// Last polled state. All `None` until the first successful poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneCache {
    pub power: Option<bool>,
    pub volume: Option<u8>,
    pub mute: Option<bool>,
    /// Index into the source list; `None` if the amplifier reported an
    /// index outside it
    pub source: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
}

/// Read-only view of an entity, as served over HTTP and MQTT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneView {
    pub unique_id: String,
    pub object_id: String,
    pub name: String,
    pub port: String,
    pub zone_index: usize,
    pub state: ZoneState,
    pub volume_level: Option<f32>,
    pub is_volume_muted: Option<bool>,
    pub source: Option<String>,
    pub source_list: Vec<String>,
    pub media_title: Option<String>,
    pub supported_features: Vec<Feature>,
    pub enabled_by_default: bool,
    pub device_info: DeviceInfo,
    pub last_polled: Option<DateTime<Utc>>,
}

pub fn unique_id(port: &str, zone_index: usize) -> String {
    format!("speakercraft_{}_{}", port, zone_index)
}

/// Unique id with everything but ASCII alphanumerics replaced, for MQTT
/// topics and other places where `/` in a serial port path would split.
pub fn object_id(unique_id: &str) -> String {
    unique_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Convert a 0.0..=1.0 level to the amplifier's 0..=100 scale (truncating).
pub fn level_to_volume(level: f32) -> u8 {
    (level.clamp(0.0, 1.0) * MAX_VOLUME as f32) as u8
}

pub fn volume_to_level(volume: u8) -> f32 {
    volume as f32 / MAX_VOLUME as f32
}

pub struct ZoneEntity {
    client: Option<SharedClient>,
    sources: Vec<String>,
    port: String,
    zone_index: usize,
    name: String,
    unique_id: String,
    cache: ZoneCache,
    snapshot: Option<ZoneStatus>,
    last_polled: Option<DateTime<Utc>>,
}

impl ZoneEntity {
    pub fn new(
        client: Option<SharedClient>,
        sources: Vec<String>,
        port: impl Into<String>,
        zone_index: usize,
        name: impl Into<String>,
    ) -> Self {
        let port = port.into();
        let unique_id = unique_id(&port, zone_index);
        Self {
            client,
            sources,
            port,
            zone_index,
            name: name.into(),
            unique_id,
            cache: ZoneCache::default(),
            snapshot: None,
            last_polled: None,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn object_id(&self) -> String {
        object_id(&self.unique_id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn zone_index(&self) -> usize {
        self.zone_index
    }

    pub fn cache(&self) -> ZoneCache {
        self.cache
    }

    pub fn snapshot_held(&self) -> Option<&ZoneStatus> {
        self.snapshot.as_ref()
    }

    pub fn state(&self) -> ZoneState {
        match self.cache.power {
            Some(true) => ZoneState::On,
            Some(false) => ZoneState::Off,
            None => ZoneState::Unknown,
        }
    }

    /// Volume as a 0.0..=1.0 fraction
    pub fn volume_level(&self) -> Option<f32> {
        self.cache.volume.map(volume_to_level)
    }

    pub fn is_volume_muted(&self) -> Option<bool> {
        self.cache.mute
    }

    pub fn source(&self) -> Option<&str> {
        self.cache
            .source
            .and_then(|i| self.sources.get(i))
            .map(String::as_str)
    }

    pub fn source_list(&self) -> &[String] {
        &self.sources
    }

    /// The amplifier has no track metadata; the source name stands in.
    pub fn media_title(&self) -> Option<&str> {
        self.source()
    }

    pub fn supported_features(&self) -> &'static [Feature] {
        SUPPORTED_FEATURES
    }

    pub fn enabled_by_default(&self) -> bool {
        self.zone_index <= LAST_ENABLED_BY_DEFAULT_ZONE
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![(DOMAIN.to_string(), self.unique_id.clone())],
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            name: self.name.clone(),
        }
    }

    pub fn view(&self) -> ZoneView {
        ZoneView {
            unique_id: self.unique_id.clone(),
            object_id: self.object_id(),
            name: self.name.clone(),
            port: self.port.clone(),
            zone_index: self.zone_index,
            state: self.state(),
            volume_level: self.volume_level(),
            is_volume_muted: self.is_volume_muted(),
            source: self.source().map(str::to_string),
            source_list: self.sources.clone(),
            media_title: self.media_title().map(str::to_string),
            supported_features: SUPPORTED_FEATURES.to_vec(),
            enabled_by_default: self.enabled_by_default(),
            device_info: self.device_info(),
            last_polled: self.last_polled,
        }
    }

    // =========================================================================
    // Poll
    // =========================================================================

    /// Refresh the cache from the amplifier.
    pub async fn update(&mut self) -> PollOutcome {
        let Some(client) = self.client.clone() else {
            return PollOutcome::NoClient;
        };

        debug!("Checking status for zone {}", self.name);
        let Some(status) = self.read_status(client).await else {
            debug!("No status for zone {}", self.name);
            return PollOutcome::NoStatus;
        };
        debug!("{:?}", status);

        self.cache = ZoneCache {
            power: Some(status.power),
            volume: Some(status.volume),
            mute: Some(status.mute),
            source: (status.source < self.sources.len()).then_some(status.source),
        };
        self.last_polled = Some(Utc::now());
        PollOutcome::Updated
    }

    async fn read_status(&self, client: SharedClient) -> Option<ZoneStatus> {
        let zone = self.zone_index;
        match tokio::task::spawn_blocking(move || client.zone_status(zone)).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Status read for zone {} failed: {}", self.name, e);
                None
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn send<F>(&self, f: F) -> CommandOutcome
    where
        F: FnOnce(&dyn AmplifierClient) + Send + 'static,
    {
        let Some(client) = self.client.clone() else {
            return CommandOutcome::Ignored(IgnoreReason::NoClient);
        };
        match tokio::task::spawn_blocking(move || f(client.as_ref())).await {
            Ok(()) => CommandOutcome::Sent,
            Err(e) => {
                warn!("Command for zone {} failed: {}", self.name, e);
                CommandOutcome::Ignored(IgnoreReason::WorkerFailed)
            }
        }
    }

    pub async fn turn_on(&self) -> CommandOutcome {
        let zone = self.zone_index;
        self.send(move |c| c.set_power(zone, true)).await
    }

    pub async fn turn_off(&self) -> CommandOutcome {
        let zone = self.zone_index;
        self.send(move |c| c.set_power(zone, false)).await
    }

    pub async fn mute_volume(&self, mute: bool) -> CommandOutcome {
        let zone = self.zone_index;
        self.send(move |c| c.set_mute(zone, mute)).await
    }

    /// Set volume from a 0.0..=1.0 level.
    pub async fn set_volume_level(&self, level: f32) -> CommandOutcome {
        let zone = self.zone_index;
        let volume = level_to_volume(level);
        self.send(move |c| c.set_volume(zone, volume)).await
    }

    pub async fn volume_up(&self) -> CommandOutcome {
        let Some(volume) = self.cache.volume else {
            return CommandOutcome::Ignored(IgnoreReason::VolumeUnknown);
        };
        let zone = self.zone_index;
        let target = volume.saturating_add(1).min(MAX_VOLUME);
        self.send(move |c| c.set_volume(zone, target)).await
    }

    pub async fn volume_down(&self) -> CommandOutcome {
        let Some(volume) = self.cache.volume else {
            return CommandOutcome::Ignored(IgnoreReason::VolumeUnknown);
        };
        let zone = self.zone_index;
        let target = volume.saturating_sub(1);
        self.send(move |c| c.set_volume(zone, target)).await
    }

    pub async fn select_source(&self, source: &str) -> CommandOutcome {
        let Some(index) = self.sources.iter().position(|s| s == source) else {
            debug!("Zone {}: ignoring unknown source {:?}", self.name, source);
            return CommandOutcome::Ignored(IgnoreReason::UnknownSource);
        };
        let zone = self.zone_index;
        self.send(move |c| c.set_source(zone, index)).await
    }

    /// Save the zone's current hardware state, replacing any held snapshot.
    pub async fn snapshot(&mut self) -> CommandOutcome {
        let Some(client) = self.client.clone() else {
            return CommandOutcome::Ignored(IgnoreReason::NoClient);
        };
        self.snapshot = self.read_status(client).await;
        match self.snapshot {
            Some(_) => CommandOutcome::Sent,
            None => CommandOutcome::Ignored(IgnoreReason::NoStatus),
        }
    }

    /// Send the held snapshot back to the amplifier, then refresh.
    pub async fn restore(&mut self) -> CommandOutcome {
        let Some(snapshot) = self.snapshot else {
            return CommandOutcome::Ignored(IgnoreReason::NoSnapshot);
        };
        let outcome = self.send(move |c| c.restore_zone(&snapshot)).await;
        if outcome.is_sent() {
            self.update().await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_is_deterministic() {
        assert_eq!(unique_id("/dev/ttyUSB0", 3), "speakercraft_/dev/ttyUSB0_3");
        assert_eq!(
            object_id(&unique_id("/dev/ttyUSB0", 3)),
            "speakercraft__dev_ttyUSB0_3"
        );
    }

    #[test]
    fn test_level_conversion_truncates() {
        assert_eq!(level_to_volume(0.5), 50);
        assert_eq!(level_to_volume(0.755), 75);
        assert_eq!(level_to_volume(1.0), 100);
        assert_eq!(level_to_volume(1.7), 100);
        assert_eq!(level_to_volume(-0.2), 0);
        assert_eq!(volume_to_level(50), 0.5);
    }

    #[tokio::test]
    async fn test_unbound_entity_ignores_everything() {
        let mut zone = ZoneEntity::new(None, vec!["Tuner".into()], "/dev/ttyUSB0", 0, "Kitchen");

        assert_eq!(zone.update().await, PollOutcome::NoClient);
        assert_eq!(
            zone.turn_on().await,
            CommandOutcome::Ignored(IgnoreReason::NoClient)
        );
        assert_eq!(
            zone.select_source("Tuner").await,
            CommandOutcome::Ignored(IgnoreReason::NoClient)
        );
        assert_eq!(
            zone.snapshot().await,
            CommandOutcome::Ignored(IgnoreReason::NoClient)
        );
        assert_eq!(zone.state(), ZoneState::Unknown);
    }

    #[test]
    fn test_enabled_by_default_cutoff() {
        let sixth = ZoneEntity::new(None, vec![], "p", 6, "a");
        let seventh = ZoneEntity::new(None, vec![], "p", 7, "b");
        assert!(sixth.enabled_by_default());
        assert!(!seventh.enabled_by_default());
    }

    #[test]
    fn test_device_info() {
        let zone = ZoneEntity::new(None, vec![], "/dev/ttyUSB0", 1, "Patio");
        let info = zone.device_info();
        assert_eq!(info.manufacturer, "Speakercraft");
        assert_eq!(info.model, "Zone Amplifier");
        assert_eq!(info.name, "Patio");
        assert_eq!(
            info.identifiers,
            vec![("mzc66".to_string(), "speakercraft_/dev/ttyUSB0_1".to_string())]
        );
    }
}
