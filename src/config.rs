use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::relay::RelayTarget;

/// Protocol versions the device library speaks.
const SUPPORTED_VERSIONS: &[&str] = &["3.1", "3.2", "3.3", "3.4", "3.5"];

#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceDescriptor,
    pub tuya: TuyaConfig,
    pub relay: RelayConfig,
    pub mqtt: Option<MqttConfig>,
    pub accessory: AccessoryInfo,
}

/// Identifies the remote device. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: String,
    pub key: String,
    pub ip: IpAddr,
    pub version: String,
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
}

#[derive(Debug, Clone)]
pub struct TuyaConfig {
    pub poll_interval: Duration,
    pub discovery_timeout: Duration,
    /// Send front-end sets to the device as dp 1 writes.
    pub forward_commands: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub target: RelayTarget,
    pub connect_timeout: Duration,
    /// Relay device-originated state changes, not only front-end ones.
    pub relay_device_reports: bool,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

/// Static accessory metadata handed to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
}

// Serde structs for parsing tinytuya device listing JSON
#[derive(Deserialize)]
struct RawDevice {
    id: String,
    key: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

fn env_required(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str) -> Result<String, ConfigError> {
    env_optional(lookup, key).ok_or(ConfigError::Missing(key))
}

fn env_optional(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.is_empty())
}

fn env_or_default<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env_optional(lookup, key) {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: v,
        }),
        None => Ok(default),
    }
}

fn env_flag(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(v) = env_optional(lookup, key) else {
        return Ok(default);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: v,
            reason: "expected a boolean".into(),
        }),
    }
}

fn env_secs(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs: u64 = env_or_default(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: "must be > 0".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let device = load_device(lookup)?;

        let mqtt = match env_optional(lookup, "MQTT_BROKER_HOST") {
            Some(broker_host) => Some(MqttConfig {
                broker_host,
                broker_port: env_or_default(lookup, "MQTT_BROKER_PORT", 1883)?,
                username: env_optional(lookup, "MQTT_USERNAME"),
                password: env_optional(lookup, "MQTT_PASSWORD"),
                topic_prefix: env_or_default(lookup, "MQTT_TOPIC_PREFIX", "tuya".to_string())?,
                client_id: env_or_default(
                    lookup,
                    "MQTT_CLIENT_ID",
                    "tuya-relay-bridge".to_string(),
                )?,
            }),
            None => None,
        };

        let config = Self {
            accessory: AccessoryInfo {
                name: device.name.clone(),
                manufacturer: env_or_default(
                    lookup,
                    "ACCESSORY_MANUFACTURER",
                    "Default-Manufacturer".to_string(),
                )?,
                model: env_or_default(lookup, "ACCESSORY_MODEL", "Default-Model".to_string())?,
                serial: env_or_default(lookup, "ACCESSORY_SERIAL", "Default-Serial".to_string())?,
            },
            device,
            tuya: TuyaConfig {
                poll_interval: env_secs(lookup, "TUYA_POLL_INTERVAL_SECS", 30)?,
                discovery_timeout: env_secs(lookup, "TUYA_DISCOVERY_TIMEOUT_SECS", 10)?,
                forward_commands: env_flag(lookup, "TUYA_FORWARD_COMMANDS", false)?,
            },
            relay: RelayConfig {
                target: RelayTarget {
                    host: env_required(lookup, "RELAY_HOST")?,
                    port: env_or_default(lookup, "RELAY_PORT", 8980)?,
                },
                connect_timeout: env_secs(lookup, "RELAY_CONNECT_TIMEOUT_SECS", 5)?,
                relay_device_reports: env_flag(lookup, "RELAY_DEVICE_REPORTS", true)?,
            },
            mqtt,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.target.port == 0 {
            return Err(ConfigError::Invalid {
                key: "RELAY_PORT",
                value: "0".into(),
                reason: "must be > 0".into(),
            });
        }
        if !SUPPORTED_VERSIONS.contains(&self.device.version.as_str()) {
            return Err(ConfigError::Invalid {
                key: "TUYA_PROTOCOL_VERSION",
                value: self.device.version.clone(),
                reason: format!("supported versions are {}", SUPPORTED_VERSIONS.join(", ")),
            });
        }
        if self.device.key.is_empty() {
            return Err(ConfigError::Missing("TUYA_DEVICE_KEY"));
        }
        if self.device.topic_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "TUYA_DEVICE_NAME",
                value: self.device.name.clone(),
                reason: "no usable topic name in device name or id".into(),
            });
        }
        Ok(())
    }
}

/// Device from explicit variables, or from a tinytuya `devices.json` when
/// `TUYA_DEVICE_ID` is unset.
fn load_device(lookup: &dyn Fn(&str) -> Option<String>) -> Result<DeviceDescriptor, ConfigError> {
    let wanted_name = env_optional(lookup, "TUYA_DEVICE_NAME");
    let version_override = env_optional(lookup, "TUYA_PROTOCOL_VERSION");

    let raw = match (env_optional(lookup, "TUYA_DEVICE_ID"), env_optional(lookup, "DEVICES_FILE")) {
        (Some(id), _) => RawDevice {
            id,
            key: env_required(lookup, "TUYA_DEVICE_KEY")?,
            ip: Some(env_required(lookup, "TUYA_DEVICE_IP")?),
            name: wanted_name,
            version: None,
        },
        (None, Some(path)) => select_device(&path, wanted_name.as_deref())?,
        (None, None) => return Err(ConfigError::Missing("TUYA_DEVICE_ID")),
    };

    let ip_str = raw.ip.ok_or_else(|| ConfigError::Invalid {
        key: "DEVICES_FILE",
        value: raw.id.clone(),
        reason: "device is missing the 'ip' field".into(),
    })?;
    let ip: IpAddr = ip_str.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        key: "TUYA_DEVICE_IP",
        value: ip_str.clone(),
        reason: e.to_string(),
    })?;

    let version = version_override
        .or(raw.version)
        .unwrap_or_else(|| "3.3".to_string());
    let name = raw.name.unwrap_or_else(|| raw.id.clone());
    // Names without any ASCII alphanumerics sanitize to nothing; use the id then.
    let topic_name = match sanitize_topic_name(&name) {
        t if t.is_empty() => sanitize_topic_name(&raw.id),
        t => t,
    };

    Ok(DeviceDescriptor {
        id: raw.id,
        key: raw.key,
        ip,
        version,
        name,
        topic_name,
    })
}

fn select_device(path: &str, wanted: Option<&str>) -> Result<RawDevice, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::DevicesFileRead {
        path: path.to_string(),
        source,
    })?;
    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(&content).map_err(|source| ConfigError::DevicesFileParse {
            path: path.to_string(),
            source,
        })?;

    raw_devices
        .into_iter()
        .find(|d| match wanted {
            Some(w) => d.name.as_deref() == Some(w) || d.id == w,
            None => true,
        })
        .ok_or_else(|| ConfigError::NoDevice(path.to_string()))
}

/// Convert a device name into a safe MQTT topic segment.
/// "Living Room Lamp" → "living_room_lamp"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("TUYA_DEVICE_ID", "d7ff5628727aa0a67197f9"),
        ("TUYA_DEVICE_KEY", "7033b96246d13311"),
        ("TUYA_DEVICE_IP", "192.168.1.53"),
        ("RELAY_HOST", "192.168.1.211"),
    ];

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_lookup(&lookup_from(MINIMAL)).unwrap();
        assert_eq!(config.device.version, "3.3");
        assert_eq!(config.device.name, "d7ff5628727aa0a67197f9");
        assert_eq!(config.relay.target.port, 8980);
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(5));
        assert!(config.relay.relay_device_reports);
        assert!(!config.tuya.forward_commands);
        assert_eq!(config.tuya.poll_interval, Duration::from_secs(30));
        assert!(config.mqtt.is_none());
        assert_eq!(config.accessory.manufacturer, "Default-Manufacturer");
    }

    #[test]
    fn mqtt_enabled_by_broker_host() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("MQTT_BROKER_HOST", "broker.local"));
        pairs.push(("TUYA_DEVICE_NAME", "Living Room Lamp"));
        let config = Config::from_lookup(&lookup_from(&pairs)).unwrap();
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.broker_port, 1883);
        assert_eq!(mqtt.topic_prefix, "tuya");
        assert_eq!(config.device.topic_name, "living_room_lamp");
    }

    #[test]
    fn missing_relay_host_is_rejected() {
        let pairs: Vec<_> = MINIMAL.iter().copied().filter(|(k, _)| *k != "RELAY_HOST").collect();
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RELAY_HOST")));
    }

    #[test]
    fn bad_values_are_rejected() {
        for (key, value) in [
            ("RELAY_PORT", "0"),
            ("RELAY_PORT", "http"),
            ("TUYA_DEVICE_IP", "not-an-ip"),
            ("TUYA_PROTOCOL_VERSION", "2.0"),
            ("TUYA_POLL_INTERVAL_SECS", "0"),
            ("RELAY_DEVICE_REPORTS", "maybe"),
        ] {
            let mut pairs: Vec<_> = MINIMAL.iter().copied().filter(|(k, _)| *k != key).collect();
            pairs.push((key, value));
            let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{key}={value}: {err}");
        }
    }

    #[test]
    fn flags_accept_common_spellings() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("RELAY_DEVICE_REPORTS", "no"));
        pairs.push(("TUYA_FORWARD_COMMANDS", "ON"));
        let config = Config::from_lookup(&lookup_from(&pairs)).unwrap();
        assert!(!config.relay.relay_device_reports);
        assert!(config.tuya.forward_commands);
    }

    #[test]
    fn device_from_devices_file() {
        let path = env::temp_dir().join(format!("tuya-relay-bridge-devices-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[
                {"id": "aaa", "key": "k1", "ip": "10.0.0.2", "name": "Fan", "version": "3.4"},
                {"id": "bbb", "key": "k2", "ip": "10.0.0.3", "name": "Desk Lamp"}
            ]"#,
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();

        let config = Config::from_lookup(&lookup_from(&[
            ("DEVICES_FILE", path_str.as_str()),
            ("TUYA_DEVICE_NAME", "Desk Lamp"),
            ("RELAY_HOST", "127.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(config.device.id, "bbb");
        assert_eq!(config.device.version, "3.3");
        assert_eq!(config.device.topic_name, "desk_lamp");

        let config = Config::from_lookup(&lookup_from(&[
            ("DEVICES_FILE", path_str.as_str()),
            ("RELAY_HOST", "127.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(config.device.id, "aaa");
        assert_eq!(config.device.version, "3.4");

        let err = Config::from_lookup(&lookup_from(&[
            ("DEVICES_FILE", path_str.as_str()),
            ("TUYA_DEVICE_NAME", "Nope"),
            ("RELAY_HOST", "127.0.0.1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoDevice(_)));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn non_ascii_name_falls_back_to_id_for_topics() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("MQTT_BROKER_HOST", "broker.local"));
        pairs.push(("TUYA_DEVICE_NAME", "客厅灯"));
        let config = Config::from_lookup(&lookup_from(&pairs)).unwrap();
        assert_eq!(config.device.name, "客厅灯");
        assert_eq!(config.device.topic_name, "d7ff5628727aa0a67197f9");
    }

    #[test]
    fn unusable_topic_name_is_rejected() {
        let mut pairs: Vec<_> = MINIMAL
            .iter()
            .copied()
            .filter(|(k, _)| *k != "TUYA_DEVICE_ID")
            .collect();
        pairs.push(("TUYA_DEVICE_ID", "---"));
        pairs.push(("TUYA_DEVICE_NAME", "客厅灯"));
        let err = Config::from_lookup(&lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TUYA_DEVICE_NAME", .. }));
    }

    #[test]
    fn sanitizes_topic_names() {
        assert_eq!(sanitize_topic_name("Solar Heat Pump"), "solar_heat_pump");
        assert_eq!(sanitize_topic_name("  Lamp!"), "lamp");
    }
}
