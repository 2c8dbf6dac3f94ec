use std::net::SocketAddr;
use std::time::Duration;

use rust_async_tuyapi::mesparse::{CommandType, Message};
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DeviceDescriptor;
use crate::error::DeviceError;

use super::{DeviceEvent, DpCommand};

/// Local port Tuya devices accept sessions on.
pub const TUYA_PORT: u16 = 6668;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct TuyaClient {
    device: DeviceDescriptor,
    discovery_timeout: Duration,
}

impl TuyaClient {
    pub fn new(device: DeviceDescriptor, discovery_timeout: Duration) -> Self {
        Self {
            device,
            discovery_timeout,
        }
    }

    /// Main device loop. Finds the device, connects, polls, handles commands,
    /// reconnects with exponential backoff on failure. Returns once the event
    /// receiver is gone.
    pub async fn run(
        &self,
        events: mpsc::Sender<DeviceEvent>,
        mut cmd_rx: mpsc::Receiver<DpCommand>,
        poll_interval: Duration,
    ) {
        let mut backoff = INITIAL_BACKOFF;

        while !events.is_closed() {
            info!(
                "Discovering device {} ({}) at {}",
                self.device.name, self.device.id, self.device.ip
            );
            if events.send(DeviceEvent::Discovering).await.is_err() {
                break;
            }

            match self.run_session(&events, &mut cmd_rx, poll_interval).await {
                Ok(()) => {
                    info!("Device {} session ended cleanly", self.device.name);
                    backoff = INITIAL_BACKOFF;
                }
                Err(DeviceError::ChannelClosed) => break,
                Err(e) => {
                    error!(
                        "Device {} session error: {}. Reconnecting in {:?}",
                        self.device.name, e, backoff
                    );
                    let _ = events.send(DeviceEvent::Disconnected).await;
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
        debug!("Device {} event channel closed, link stopped", self.device.name);
    }

    /// Resolve the device's network presence: its session port must accept a
    /// connection within the discovery timeout.
    pub async fn find(&self) -> Result<(), DeviceError> {
        let addr = SocketAddr::new(self.device.ip, TUYA_PORT);
        match tokio::time::timeout(self.discovery_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_probe)) => {
                debug!("Device {} answered at {}", self.device.name, addr);
                Ok(())
            }
            Ok(Err(source)) => Err(DeviceError::Probe {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(DeviceError::NotFound {
                addr: addr.to_string(),
                timeout: self.discovery_timeout,
            }),
        }
    }

    async fn run_session(
        &self,
        events: &mpsc::Sender<DeviceEvent>,
        cmd_rx: &mut mpsc::Receiver<DpCommand>,
        poll_interval: Duration,
    ) -> Result<(), DeviceError> {
        self.find().await?;

        let mut device = TuyaDevice::new(
            &self.device.version,
            &self.device.id,
            Some(&self.device.key),
            self.device.ip,
        )
        .map_err(|e| DeviceError::Protocol(format!("Failed to create device: {e:?}")))?;

        let mut receiver = device
            .connect()
            .await
            .map_err(|e| DeviceError::Protocol(format!("Failed to connect: {e:?}")))?;

        info!("Connected to device {}", self.device.name);
        events
            .send(DeviceEvent::Connected)
            .await
            .map_err(|_| DeviceError::ChannelClosed)?;

        // Refresh on connect so the mirror picks up the current state
        self.query_all_dps(&mut device).await?;

        let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut poll_timer = tokio::time::interval(poll_interval);
        // Skip first tick (we already queried)
        poll_timer.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    device.heartbeat().await
                        .map_err(|e| DeviceError::Protocol(format!("Heartbeat failed: {e:?}")))?;
                }
                _ = poll_timer.tick() => {
                    self.query_all_dps(&mut device).await?;
                }
                msg = receiver.recv() => {
                    match msg {
                        Some(Ok(messages)) => {
                            for m in messages {
                                if m.command == Some(CommandType::HeartBeat) {
                                    continue;
                                }
                                self.process_message(&m, events).await?;
                            }
                        }
                        Some(Err(e)) => {
                            return Err(DeviceError::Protocol(format!("Device error: {e:?}")));
                        }
                        None => {
                            return Err(DeviceError::Protocol("Device channel closed".into()));
                        }
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    info!("Sending command to {}: {}", self.device.name, cmd.dps);
                    if let Err(e) = device.set_values(cmd.dps.clone()).await {
                        warn!("Failed to send command to {}: {:?}", self.device.name, e);
                    }
                }
            }
        }
    }

    async fn query_all_dps(&self, device: &mut TuyaDevice) -> Result<(), DeviceError> {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.device.id.clone(),
            gw_id: Some(self.device.id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });

        device
            .get(payload)
            .await
            .map_err(|e| DeviceError::Protocol(format!("DP query failed: {e:?}")))
    }

    async fn process_message(
        &self,
        msg: &Message,
        events: &mpsc::Sender<DeviceEvent>,
    ) -> Result<(), DeviceError> {
        let Some(dps) = extract_dps(&msg.payload) else {
            debug!("No dps in message, skipping");
            return Ok(());
        };
        if !dps.is_object() {
            debug!("dps is not a JSON object: {}", dps);
            return Ok(());
        }

        info!("Received data from device {}: {}", self.device.name, dps);
        events
            .send(DeviceEvent::StateReported(dps))
            .await
            .map_err(|_| DeviceError::ChannelClosed)
    }
}

/// Extract dps from whichever payload variant the library returns.
/// rust-async-tuyapi sometimes returns DP query responses as Payload::String
/// containing JSON like {"dps":{"1":true}} instead of Payload::Struct.
fn extract_dps(payload: &Payload) -> Option<serde_json::Value> {
    match payload {
        Payload::Struct(ps) => {
            debug!("PayloadStruct: dev_id={}, dps={:?}", ps.dev_id, ps.dps);
            ps.dps.clone()
        }
        Payload::String(s) => {
            debug!("Payload::String, attempting JSON parse");
            dps_from_json(s)
        }
        Payload::Raw(b) => {
            debug!("Payload::Raw ({} bytes), skipping", b.len());
            None
        }
        _ => None,
    }
}

fn dps_from_json(s: &str) -> Option<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(s)
        .ok()
        .and_then(|v| v.get("dps").cloned())
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
