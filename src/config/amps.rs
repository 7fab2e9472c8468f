//! Amplifier layout: legacy flat keys and the structured list form
//!
//! Older installs stored the layout as flat keys for exactly two amplifiers:
//!
//! ```json
//! {"amp1_port": "/dev/ttyUSB0", "amp1_zone0": "Kitchen", "amp1_source0": "Tuner", ...}
//! ```
//!
//! The structured form is a list of amplifiers:
//!
//! ```json
//! {"amps": [{"port": "/dev/ttyUSB0", "zones": ["Kitchen"], "sources": ["Tuner"]}]}
//! ```
//!
//! Both are resolved once at load time into [`StructuredConfig`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefixes of the two amplifier slots in the legacy layout
pub const LEGACY_AMP_PREFIXES: &[&str] = &["amp1", "amp2"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {key} in legacy amplifier layout")]
    MissingPort { key: String },
    #[error("{key} must be a string")]
    NotAString { key: String },
    #[error("amplifier layout must be a JSON object")]
    NotAnObject,
    #[error("invalid amplifier layout: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("invalid amplifier prefix: {0}")]
    Pattern(#[from] regex::Error),
}

/// A named source or zone. `index` is the number found in the legacy key,
/// or the list position for plain-string entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub index: u32,
    pub name: String,
}

impl Slot {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SlotRepr {
    Name(String),
    Indexed { index: u32, name: String },
}

fn deserialize_slots<'de, D>(deserializer: D) -> Result<Vec<Slot>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<SlotRepr>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(position, repr)| match repr {
            SlotRepr::Name(name) => Slot::new(position as u32, name),
            SlotRepr::Indexed { index, name } => Slot::new(index, name),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmpConfig {
    pub port: String,
    /// Required, like `zones`; an empty list is allowed
    #[serde(deserialize_with = "deserialize_slots")]
    pub sources: Vec<Slot>,
    #[serde(deserialize_with = "deserialize_slots")]
    pub zones: Vec<Slot>,
}

impl AmpConfig {
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    pub fn zone_names(&self) -> Vec<String> {
        self.zones.iter().map(|s| s.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructuredConfig {
    pub amps: Vec<AmpConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AmpsConfig {
    /// Flat `ampN_*` keys, in file order
    Legacy(Map<String, Value>),
    Structured(StructuredConfig),
}

impl AmpsConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(map) = value else {
            return Err(ConfigError::NotAnObject);
        };
        if map.contains_key("amps") {
            let structured = serde_json::from_value(Value::Object(map))?;
            Ok(Self::Structured(structured))
        } else {
            Ok(Self::Legacy(map))
        }
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(s)?)
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// Resolve to the structured form. Already structured input comes back
    /// unchanged.
    pub fn resolve(self) -> Result<StructuredConfig, ConfigError> {
        match self {
            Self::Structured(structured) => Ok(structured),
            Self::Legacy(map) => {
                let amps = LEGACY_AMP_PREFIXES
                    .iter()
                    .map(|prefix| translate_amp(prefix, &map))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StructuredConfig { amps })
            }
        }
    }
}

fn slot_pattern(prefix: &str, kind: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"{}_{}(\d)", regex::escape(prefix), kind))
}

/// Collect one legacy amplifier slot. Sources and zones keep the order their
/// keys appear in; indices are neither sorted nor checked for gaps.
pub fn translate_amp(prefix: &str, entry: &Map<String, Value>) -> Result<AmpConfig, ConfigError> {
    let port_key = format!("{}_port", prefix);
    let port = match entry.get(&port_key) {
        Some(Value::String(port)) => port.clone(),
        Some(_) => return Err(ConfigError::NotAString { key: port_key }),
        None => return Err(ConfigError::MissingPort { key: port_key }),
    };

    let source_re = slot_pattern(prefix, "source")?;
    let zone_re = slot_pattern(prefix, "zone")?;
    let mut sources = Vec::new();
    let mut zones = Vec::new();

    for (key, value) in entry {
        for (re, slots) in [(&source_re, &mut sources), (&zone_re, &mut zones)] {
            let Some(index) = re
                .captures(key)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };
            let Value::String(name) = value else {
                return Err(ConfigError::NotAString { key: key.clone() });
            };
            slots.push(Slot::new(index, name.clone()));
        }
    }

    Ok(AmpConfig {
        port,
        sources,
        zones,
    })
}
