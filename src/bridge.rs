use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::mirror::StateMirror;
use crate::power::PowerState;
use crate::relay::RelayClient;
use crate::tuya::{DeviceEvent, DpCommand};

/// Handler pair a front end registers for the power characteristic.
pub trait PowerCharacteristic: Send + Sync {
    fn on_set(&self, state: PowerState);
    fn on_get(&self) -> PowerState;
}

/// Where the device link stands. `Disconnected` events put it back to `Discovering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Uninitialized,
    Discovering,
    Connected,
}

impl LinkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Discovering => "discovering",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ties the mirror, the relay client and the device link together.
///
/// Front-end sets and device reports go through the same path: write the
/// mirror, then fire one relay notification without waiting for it. Relay
/// failures never reach the caller.
#[derive(Clone)]
pub struct BridgeAdapter {
    mirror: Arc<StateMirror>,
    relay: RelayClient,
    link: Arc<watch::Sender<LinkState>>,
    /// Power flag from the previous device report; polls repeat it unchanged.
    last_report: Arc<watch::Sender<Option<PowerState>>>,
    device_cmd_tx: Option<mpsc::Sender<DpCommand>>,
    relay_device_reports: bool,
}

impl BridgeAdapter {
    pub fn new(mirror: Arc<StateMirror>, relay: RelayClient) -> Self {
        let (link, _) = watch::channel(LinkState::Uninitialized);
        let (last_report, _) = watch::channel(None);
        Self {
            mirror,
            relay,
            link: Arc::new(link),
            last_report: Arc::new(last_report),
            device_cmd_tx: None,
            relay_device_reports: true,
        }
    }

    /// Forward front-end sets to the device as power commands.
    pub fn with_device_commands(mut self, tx: mpsc::Sender<DpCommand>) -> Self {
        self.device_cmd_tx = Some(tx);
        self
    }

    pub fn relay_device_reports(mut self, enabled: bool) -> Self {
        self.relay_device_reports = enabled;
        self
    }

    pub fn mirror(&self) -> &Arc<StateMirror> {
        &self.mirror
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Front-end set. Returns the mirror write sequence number once the mirror
    /// holds the new value; the relay runs in the background.
    pub fn set_power(&self, state: PowerState) -> u64 {
        info!("Set power -> {}", state);
        let version = self.mirror.set(state);

        if let Some(tx) = &self.device_cmd_tx {
            if let Err(e) = tx.try_send(DpCommand::power(state)) {
                warn!("Could not queue power command for device: {}", e);
            }
        }

        self.relay.spawn_notify(state);
        version
    }

    pub fn power(&self) -> PowerState {
        let state = self.mirror.get();
        debug!("Get power -> {}", state);
        state
    }

    /// Apply a device report. Only a boolean data-point "1" that differs from
    /// the previous report changes anything; returns the mirror sequence
    /// number when it did.
    pub fn on_device_state_reported(&self, dps: &serde_json::Value) -> Option<u64> {
        let Some(state) = PowerState::from_dps(dps) else {
            debug!("No power flag in report, ignoring: {}", dps);
            return None;
        };

        let changed = self.last_report.send_if_modified(|last| {
            if *last == Some(state) {
                return false;
            }
            *last = Some(state);
            true
        });
        if !changed {
            debug!("Device repeated power {}, nothing to relay", state);
            return None;
        }

        info!("Device reported power {}", state);
        let version = self.mirror.set(state);
        if self.relay_device_reports {
            self.relay.spawn_notify(state);
        }
        Some(version)
    }

    pub fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Discovering => self.transition(LinkState::Discovering),
            DeviceEvent::Connected => {
                info!("Connected to device!");
                self.transition(LinkState::Connected);
            }
            DeviceEvent::Disconnected => {
                warn!("Lost device session");
                self.transition(LinkState::Discovering);
            }
            DeviceEvent::StateReported(dps) => {
                self.on_device_state_reported(&dps);
            }
        }
    }

    /// Process device events until the link side hangs up.
    pub async fn run(self, mut events: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Device event stream ended");
    }

    fn transition(&self, next: LinkState) {
        self.link.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Link {} -> {}", current, next);
            *current = next;
            true
        });
    }
}

impl PowerCharacteristic for BridgeAdapter {
    fn on_set(&self, state: PowerState) {
        self.set_power(state);
    }

    fn on_get(&self) -> PowerState {
        self.power()
    }
}
