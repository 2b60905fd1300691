pub mod bridge;
mod legacy;
mod loader;
mod registry;

pub use bridge::{AgentDescriptor, BridgeAgent};
pub use legacy::LegacyAdapter;
pub use loader::{AgentSource, PluginLoader};
pub use registry::{AgentRegistry, RegistryInfo, RegistryMetrics};
