pub mod client;

use serde_json::json;

use crate::power::{POWER_DP, PowerState};

/// What the device link tells the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A discover + connect attempt has started.
    Discovering,
    /// A session is established.
    Connected,
    /// The session failed; the link will retry after a backoff.
    Disconnected,
    /// A dps object as reported by the device (dp_id → JSON value).
    StateReported(serde_json::Value),
}

/// A command to send to the Tuya device (dp_id → JSON value).
#[derive(Debug, Clone, PartialEq)]
pub struct DpCommand {
    pub dps: serde_json::Value,
}

impl DpCommand {
    pub fn power(state: PowerState) -> Self {
        let mut dps = serde_json::Map::new();
        dps.insert(POWER_DP.to_string(), json!(state.is_on()));
        Self {
            dps: serde_json::Value::Object(dps),
        }
    }
}
