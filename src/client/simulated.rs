//! In-memory amplifier
//!
//! Behaves like an MZC-66 as seen through the client contract: commands
//! change zone state immediately and are visible on the next status read.
//! Every call is recorded so callers can assert on what was sent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::{
    AmplifierClient, AmplifierConnector, ClientError, SharedClient, ZoneStatus, MAX_VOLUME,
};

/// A call received by the simulated amplifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    ZoneStatus(usize),
    SetPower(usize, bool),
    SetMute(usize, bool),
    SetVolume(usize, u8),
    SetSource(usize, usize),
    RestoreZone(ZoneStatus),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimulatedAmplifier {
    port: String,
    zones: Mutex<Vec<ZoneStatus>>,
    calls: Mutex<Vec<ClientCall>>,
    offline: AtomicBool,
}

impl SimulatedAmplifier {
    pub fn new(port: impl Into<String>, zone_count: usize) -> Self {
        let zones = (0..zone_count)
            .map(|zone| ZoneStatus {
                zone,
                power: false,
                volume: 20,
                mute: false,
                source: 0,
            })
            .collect();
        Self {
            port: port.into(),
            zones: Mutex::new(zones),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// While offline, status reads return `None` and commands are dropped.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Overwrite a zone's state as if changed from the amplifier's keypad.
    pub fn set_zone(&self, status: ZoneStatus) {
        if let Some(slot) = lock(&self.zones).get_mut(status.zone) {
            *slot = status;
        }
    }

    pub fn zone(&self, zone: usize) -> Option<ZoneStatus> {
        lock(&self.zones).get(zone).copied()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        lock(&self.calls).clone()
    }

    /// Recorded calls other than status reads.
    pub fn commands(&self) -> Vec<ClientCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| !matches!(c, ClientCall::ZoneStatus(_)))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: ClientCall) {
        lock(&self.calls).push(call);
    }

    fn modify(&self, zone: usize, f: impl FnOnce(&mut ZoneStatus)) {
        if self.offline.load(Ordering::SeqCst) {
            return;
        }
        if let Some(status) = lock(&self.zones).get_mut(zone) {
            f(status);
        }
    }
}

impl AmplifierClient for SimulatedAmplifier {
    fn zone_status(&self, zone: usize) -> Option<ZoneStatus> {
        self.record(ClientCall::ZoneStatus(zone));
        if self.offline.load(Ordering::SeqCst) {
            return None;
        }
        self.zone(zone)
    }

    fn set_power(&self, zone: usize, power: bool) {
        self.record(ClientCall::SetPower(zone, power));
        self.modify(zone, |s| s.power = power);
    }

    fn set_mute(&self, zone: usize, mute: bool) {
        self.record(ClientCall::SetMute(zone, mute));
        self.modify(zone, |s| s.mute = mute);
    }

    fn set_volume(&self, zone: usize, volume: u8) {
        self.record(ClientCall::SetVolume(zone, volume));
        self.modify(zone, |s| s.volume = volume.min(MAX_VOLUME));
    }

    fn set_source(&self, zone: usize, source: usize) {
        self.record(ClientCall::SetSource(zone, source));
        self.modify(zone, |s| s.source = source);
    }

    fn restore_zone(&self, status: &ZoneStatus) {
        self.record(ClientCall::RestoreZone(*status));
        let restored = *status;
        self.modify(status.zone, |s| *s = restored);
    }
}

/// Hands out one [`SimulatedAmplifier`] per port, created on first acquire.
pub struct SimulatedConnector {
    zone_count: usize,
    amps: Mutex<HashMap<String, Arc<SimulatedAmplifier>>>,
    unavailable: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
}

impl SimulatedConnector {
    pub fn new(zone_count: usize) -> Self {
        Self {
            zone_count,
            amps: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Make `acquire` fail for this port until [`Self::set_available`].
    pub fn set_unavailable(&self, port: &str) {
        lock(&self.unavailable).insert(port.to_string());
    }

    pub fn set_available(&self, port: &str) {
        lock(&self.unavailable).remove(port);
    }

    pub fn amplifier(&self, port: &str) -> Option<Arc<SimulatedAmplifier>> {
        lock(&self.amps).get(port).cloned()
    }

    /// Number of acquire calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AmplifierConnector for SimulatedConnector {
    fn acquire(&self, port: &str) -> Result<SharedClient, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if lock(&self.unavailable).contains(port) {
            debug!("Simulated port {} is unavailable", port);
            return Err(ClientError::Connection {
                port: port.to_string(),
                reason: "port unavailable".to_string(),
            });
        }

        let mut amps = lock(&self.amps);
        let amp = amps
            .entry(port.to_string())
            .or_insert_with(|| {
                info!(
                    "Simulated amplifier on {} with {} zones",
                    port, self.zone_count
                );
                Arc::new(SimulatedAmplifier::new(port, self.zone_count))
            })
            .clone();
        Ok(amp)
    }
}
