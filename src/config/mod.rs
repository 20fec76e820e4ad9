//! Player configuration

mod schema;
mod store;

pub use schema::{
    CapabilityOverride, CodecConfig, IceServerConfig, PlayerConfig, SignalingConfig, TurnServer,
};
pub use store::ConfigStore;
