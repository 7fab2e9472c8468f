//! Amplifier adapter and integrations (MQTT)

pub mod handle;
pub mod mqtt;
pub mod speakercraft;
pub mod traits;

pub use handle::{AdapterHandle, RetryConfig};
pub use speakercraft::SpeakercraftAdapter;
pub use traits::{AdapterContext, AdapterLogic};
