use std::fmt;
use std::str::FromStr;

use crate::error::ValueError;

/// Data-point carrying the power flag on Tuya lights and switches.
pub const POWER_DP: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    #[default]
    Off,
    On,
}

impl PowerState {
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    /// Token written to the relay peer.
    pub const fn token(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Value published on the front end's state topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Read the power flag out of a reported dps object.
    /// Only a boolean under key "1" counts; any other shape is `None`.
    pub fn from_dps(dps: &serde_json::Value) -> Option<Self> {
        dps.as_object()?
            .get(POWER_DP)?
            .as_bool()
            .map(Self::from)
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for PowerState {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(Self::On),
            "off" | "false" | "0" => Ok(Self::Off),
            _ => Err(ValueError::InvalidPowerState(s.to_string())),
        }
    }
}
