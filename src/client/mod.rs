//! Amplifier client contract
//!
//! The amplifier is driven through a blocking, serial-backed client. This
//! module only defines the call contract consumed by the zone entities; the
//! wire encoding lives behind [`AmplifierConnector`] implementations.

pub mod simulated;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use simulated::{ClientCall, SimulatedAmplifier, SimulatedConnector};

/// Highest volume step the amplifier accepts.
pub const MAX_VOLUME: u8 = 100;

/// Status of one zone as reported by the amplifier.
///
/// Also used as the snapshot payload: `restore_zone` takes the whole status
/// back, including the zone it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub zone: usize,
    pub power: bool,
    /// 0..=100
    pub volume: u8,
    pub mute: bool,
    /// Raw source index, not validated against the configured source list.
    pub source: usize,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to amplifier on {port}: {reason}")]
    Connection { port: String, reason: String },
}

/// Blocking per-zone operations on one amplifier.
///
/// Every call may block on device I/O. Callers on the async runtime must go
/// through `spawn_blocking`. Commands are fire-and-forget.
pub trait AmplifierClient: Send + Sync {
    fn zone_status(&self, zone: usize) -> Option<ZoneStatus>;
    fn set_power(&self, zone: usize, power: bool);
    fn set_mute(&self, zone: usize, mute: bool);
    fn set_volume(&self, zone: usize, volume: u8);
    fn set_source(&self, zone: usize, source: usize);
    fn restore_zone(&self, status: &ZoneStatus);
}

pub type SharedClient = Arc<dyn AmplifierClient>;

/// Opens (or reuses) the client for a serial port.
pub trait AmplifierConnector: Send + Sync {
    fn acquire(&self, port: &str) -> Result<SharedClient, ClientError>;
}
