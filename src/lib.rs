//! Mirrors the power state of a Tuya light and relays every change to a
//! local TCP peer as a bare `on` / `off` token.

pub mod bridge;
pub mod config;
pub mod error;
pub mod mirror;
pub mod mqtt;
pub mod power;
pub mod relay;
pub mod tuya;

pub use bridge::{BridgeAdapter, LinkState, PowerCharacteristic};
pub use mirror::{Snapshot, StateMirror};
pub use power::PowerState;
pub use relay::{RelayClient, RelayTarget};
