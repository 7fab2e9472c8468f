//! MZC-66 Bridge
//!
//! Exposes the zones of Speakercraft MZC-66 multi-zone amplifiers over HTTP
//! and MQTT (Home Assistant).
//!
//! This library provides:
//! - Amplifier layout loading, including migration of the legacy flat-key form
//! - One polled entity per zone, with power/volume/mute/source control
//! - Per-zone snapshot and restore
//! - MQTT integration for Home Assistant
//! - Server-Sent Events for real-time updates

pub mod adapters;
pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod platform;
pub mod zone;
