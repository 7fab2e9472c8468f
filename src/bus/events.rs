//! Event and command types carried on the bus.

use serde::{Deserialize, Serialize};

use crate::zone::ZoneView;

// =============================================================================
// Commands
// =============================================================================

/// Actions that can be sent to a zone.
///
/// Wire form: `{"action": "select_source", "params": {"source": "Tuner"}}`,
/// or just `{"action": "turn_on"}` for actions without parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum ZoneCommand {
    TurnOn,
    TurnOff,

    /// Set mute state
    Mute {
        muted: bool,
    },

    /// Set absolute volume
    SetVolume {
        /// 0.0..=1.0
        level: f32,
    },

    VolumeUp,
    VolumeDown,

    SelectSource {
        source: String,
    },

    /// Save the zone's current hardware state
    Snapshot,

    /// Send the saved state back to the zone
    Restore,
}

impl ZoneCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::Mute { .. } => "mute",
            Self::SetVolume { .. } => "set_volume",
            Self::VolumeUp => "volume_up",
            Self::VolumeDown => "volume_down",
            Self::SelectSource { .. } => "select_source",
            Self::Snapshot => "snapshot",
            Self::Restore => "restore",
        }
    }
}

// =============================================================================
// Bus Events
// =============================================================================

/// All events that can be published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[allow(clippy::large_enum_variant)] // ZoneView carries the full zone state
pub enum BusEvent {
    // =========================================================================
    // Zone Lifecycle Events
    // =========================================================================
    /// A zone entity was registered (after its initial refresh)
    ZoneDiscovered { zone: ZoneView },

    /// A poll or command changed a zone's cached state
    ZoneUpdated { zone: ZoneView },

    /// A zone entity was unloaded
    ZoneRemoved { unique_id: String, object_id: String },

    // =========================================================================
    // Amplifier Events
    // =========================================================================
    /// A client was acquired for an amplifier port
    AmplifierConnected { port: String },

    /// Client acquisition failed; setup will be retried
    AmplifierUnavailable { port: String, reason: String },

    // =========================================================================
    // Command Events
    // =========================================================================
    /// A command arrived from outside (MQTT) for a zone.
    /// `zone_id` is either the unique id or the object id.
    ControlCommand { zone_id: String, command: ZoneCommand },

    // =========================================================================
    // Adapter Lifecycle Events
    // =========================================================================
    AdapterStopped { adapter: String },

    /// System is shutting down
    ShuttingDown { reason: Option<String> },
}
