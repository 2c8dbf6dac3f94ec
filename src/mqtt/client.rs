use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bridge::{LinkState, PowerCharacteristic};
use crate::config::{AccessoryInfo, MqttConfig};
use crate::mirror::Snapshot;
use crate::power::PowerState;

/// Topics for one accessory, all under `{prefix}/{topic_name}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub set: String,
    pub get: String,
    pub state: String,
    pub link: String,
    pub info: String,
    pub bridge_status: String,
}

/// An incoming front-end request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Set(PowerState),
    Get,
}

impl Topics {
    pub fn new(prefix: &str, topic_name: &str) -> Self {
        let base = format!("{prefix}/{topic_name}");
        Self {
            set: format!("{base}/set"),
            get: format!("{base}/get"),
            state: format!("{base}/state"),
            link: format!("{base}/link"),
            info: format!("{base}/info"),
            bridge_status: format!("{base}/bridge_status"),
        }
    }

    /// Map an incoming publish to a request. Unknown topics and unparseable
    /// set payloads are `None`.
    pub fn parse_request(&self, topic: &str, payload: &str) -> Option<Request> {
        if topic == self.get {
            return Some(Request::Get);
        }
        if topic != self.set {
            return None;
        }
        match payload.parse::<PowerState>() {
            Ok(state) => Some(Request::Set(state)),
            Err(e) => {
                warn!("Ignoring set request on {}: {}", topic, e);
                None
            }
        }
    }
}

pub struct MqttFrontEnd {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Topics,
    accessory: AccessoryInfo,
}

impl MqttFrontEnd {
    pub fn new(config: &MqttConfig, topic_name: &str, accessory: AccessoryInfo) -> Self {
        let mut mqttopts =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttopts.set_credentials(user, pass);
        }

        let topics = Topics::new(&config.topic_prefix, topic_name);

        // LWT: publish "offline" on disconnect
        let lwt = rumqttc::LastWill::new(
            &topics.bridge_status,
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            topics,
            accessory,
        }
    }

    /// Run the MQTT event loop. Subscribes to the set/get topics on connect,
    /// routes requests to the registered handlers and publishes every mirror
    /// and link change.
    pub async fn run(
        self,
        handlers: Arc<dyn PowerCharacteristic>,
        mut state_rx: watch::Receiver<Snapshot>,
        mut link_rx: watch::Receiver<LinkState>,
    ) {
        let Self {
            client,
            mut eventloop,
            topics,
            accessory,
        } = self;
        let mut session = Session::new(client, topics, accessory, handlers);

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            let link = *link_rx.borrow();
                            session.on_connect(link).await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            session.on_publish(&publish).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Ok(()) = state_rx.changed() => {
                    let state = state_rx.borrow_and_update().state;
                    session.on_state_change(state).await;
                }
                Ok(()) = link_rx.changed() => {
                    let link = *link_rx.borrow_and_update();
                    session.publish(&session.topics.link, link.as_str(), true).await;
                }
            }
        }
    }
}

/// Everything the event loop needs besides the `EventLoop` itself.
struct Session {
    client: AsyncClient,
    topics: Topics,
    accessory: AccessoryInfo,
    handlers: Arc<dyn PowerCharacteristic>,
    last_state: Option<PowerState>,
}

impl Session {
    fn new(
        client: AsyncClient,
        topics: Topics,
        accessory: AccessoryInfo,
        handlers: Arc<dyn PowerCharacteristic>,
    ) -> Self {
        Self {
            client,
            topics,
            accessory,
            handlers,
            last_state: None,
        }
    }

    async fn on_connect(&mut self, link: LinkState) {
        self.publish(&self.topics.bridge_status, "online", true).await;

        match serde_json::to_vec(&self.accessory) {
            Ok(info) => self.publish(&self.topics.info, info, true).await,
            Err(e) => error!("Failed to encode accessory info: {}", e),
        }

        let state = self.handlers.on_get();
        self.publish(&self.topics.state, state.as_str(), true).await;
        self.last_state = Some(state);
        self.publish(&self.topics.link, link.as_str(), true).await;

        for topic in [&self.topics.set, &self.topics.get] {
            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("Failed to subscribe to {}: {}", topic, e);
            }
        }
    }

    async fn on_publish(&mut self, publish: &Publish) {
        let payload = String::from_utf8_lossy(&publish.payload);
        match self.topics.parse_request(&publish.topic, &payload) {
            // A retained set would be replayed on every reconnect.
            Some(Request::Set(_)) if publish.retain => {
                warn!("Ignoring retained set request on {}", publish.topic);
            }
            // The mirror change comes back through the state watch and is published there.
            Some(Request::Set(state)) => self.handlers.on_set(state),
            Some(Request::Get) => {
                let state = self.handlers.on_get();
                self.publish(&self.topics.state, state.as_str(), true).await;
                self.last_state = Some(state);
            }
            None => debug!("Unhandled publish on {}", publish.topic),
        }
    }

    async fn on_state_change(&mut self, state: PowerState) {
        if self.last_state == Some(state) {
            return;
        }
        info!("Publishing {}: {}", self.topics.state, state.as_str());
        self.publish(&self.topics.state, state.as_str(), true).await;
        self.last_state = Some(state);
    }

    async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            warn!("Failed to publish {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeAdapter;
    use crate::mirror::StateMirror;
    use crate::relay::{RelayClient, RelayTarget};

    fn bridge() -> BridgeAdapter {
        // Relay to a port nothing listens on; notifications fail and get logged.
        let relay = RelayClient::new(
            RelayTarget {
                host: "127.0.0.1".into(),
                port: 9,
            },
            Duration::from_millis(200),
        );
        BridgeAdapter::new(Arc::new(StateMirror::default()), relay)
    }

    fn accessory() -> AccessoryInfo {
        AccessoryInfo {
            name: "Lamp".into(),
            manufacturer: "Default-Manufacturer".into(),
            model: "Default-Model".into(),
            serial: "Default-Serial".into(),
        }
    }

    fn session(bridge: &BridgeAdapter) -> (Session, flume::Receiver<rumqttc::Request>) {
        let (tx, rx) = flume::bounded(32);
        let session = Session::new(
            AsyncClient::from_senders(tx),
            Topics::new("tuya", "lamp"),
            accessory(),
            Arc::new(bridge.clone()),
        );
        (session, rx)
    }

    /// (topic, payload, retain) of every publish queued so far.
    fn published(rx: &flume::Receiver<rumqttc::Request>) -> Vec<(String, String, bool)> {
        rx.try_iter()
            .filter_map(|req| match req {
                rumqttc::Request::Publish(p) => Some((
                    p.topic,
                    String::from_utf8_lossy(&p.payload).to_string(),
                    p.retain,
                )),
                _ => None,
            })
            .collect()
    }

    fn incoming(topic: &str, payload: &str, retain: bool) -> Publish {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload);
        publish.retain = retain;
        publish
    }

    #[test]
    fn topics_live_under_prefix_and_name() {
        let topics = Topics::new("tuya", "desk_lamp");
        assert_eq!(topics.set, "tuya/desk_lamp/set");
        assert_eq!(topics.get, "tuya/desk_lamp/get");
        assert_eq!(topics.state, "tuya/desk_lamp/state");
        assert_eq!(topics.bridge_status, "tuya/desk_lamp/bridge_status");
    }

    #[test]
    fn parses_requests() {
        let topics = Topics::new("tuya", "lamp");
        assert_eq!(
            topics.parse_request("tuya/lamp/set", "ON"),
            Some(Request::Set(PowerState::On))
        );
        assert_eq!(
            topics.parse_request("tuya/lamp/set", "false"),
            Some(Request::Set(PowerState::Off))
        );
        assert_eq!(topics.parse_request("tuya/lamp/get", ""), Some(Request::Get));
    }

    #[test]
    fn ignores_bad_payloads_and_foreign_topics() {
        let topics = Topics::new("tuya", "lamp");
        assert_eq!(topics.parse_request("tuya/lamp/set", "dim"), None);
        assert_eq!(topics.parse_request("tuya/other/set", "ON"), None);
        assert_eq!(topics.parse_request("tuya/lamp/state", "ON"), None);
    }

    #[tokio::test]
    async fn connect_announces_and_subscribes() {
        let bridge = bridge();
        let (mut session, rx) = session(&bridge);

        session.on_connect(LinkState::Discovering).await;

        let requests: Vec<_> = rx.try_iter().collect();
        let subscribed: Vec<String> = requests
            .iter()
            .filter_map(|req| match req {
                rumqttc::Request::Subscribe(s) => Some(s.filters[0].path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(subscribed, vec!["tuya/lamp/set", "tuya/lamp/get"]);

        let publishes: Vec<(String, String)> = requests
            .into_iter()
            .filter_map(|req| match req {
                rumqttc::Request::Publish(p) => {
                    Some((p.topic, String::from_utf8_lossy(&p.payload).to_string()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(publishes[0], ("tuya/lamp/bridge_status".into(), "online".into()));
        assert_eq!(publishes[1].0, "tuya/lamp/info");
        assert!(publishes[1].1.contains("\"manufacturer\":\"Default-Manufacturer\""));
        assert_eq!(publishes[2], ("tuya/lamp/state".into(), "OFF".into()));
        assert_eq!(publishes[3], ("tuya/lamp/link".into(), "discovering".into()));
    }

    #[tokio::test]
    async fn set_routes_to_handler() {
        let bridge = bridge();
        let (mut session, rx) = session(&bridge);

        session.on_publish(&incoming("tuya/lamp/set", "ON", false)).await;
        assert_eq!(bridge.on_get(), PowerState::On);
        // State is published from the mirror watch, not from the request.
        assert!(published(&rx).is_empty());
    }

    #[tokio::test]
    async fn retained_set_is_not_replayed() {
        let bridge = bridge();
        let (mut session, _rx) = session(&bridge);

        session.on_publish(&incoming("tuya/lamp/set", "ON", true)).await;
        assert_eq!(bridge.on_get(), PowerState::Off);
        assert_eq!(bridge.mirror().snapshot().version, 0);
    }

    #[tokio::test]
    async fn get_publishes_current_state() {
        let bridge = bridge();
        bridge.on_set(PowerState::On);
        let (mut session, rx) = session(&bridge);

        session.on_publish(&incoming("tuya/lamp/get", "", false)).await;
        session.on_publish(&incoming("tuya/lamp/get", "", false)).await;
        assert_eq!(
            published(&rx),
            vec![
                ("tuya/lamp/state".to_string(), "ON".to_string(), true),
                ("tuya/lamp/state".to_string(), "ON".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn state_changes_are_deduplicated() {
        let bridge = bridge();
        let (mut session, rx) = session(&bridge);

        session.on_state_change(PowerState::On).await;
        session.on_state_change(PowerState::On).await;
        session.on_state_change(PowerState::Off).await;
        let states: Vec<String> = published(&rx).into_iter().map(|(_, p, _)| p).collect();
        assert_eq!(states, vec!["ON", "OFF"]);
    }

    #[tokio::test]
    async fn run_can_be_spawned_without_a_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = MqttConfig {
            broker_host: "127.0.0.1".into(),
            broker_port: port,
            username: None,
            password: None,
            topic_prefix: "tuya".into(),
            client_id: "tuya-relay-bridge-test".into(),
        };
        let bridge = bridge();
        let front_end = MqttFrontEnd::new(&config, "lamp", accessory());
        let handle = tokio::spawn(front_end.run(
            Arc::new(bridge.clone()),
            bridge.mirror().subscribe(),
            bridge.subscribe_link(),
        ));

        // The loop keeps retrying the broker and keeps the handlers usable meanwhile.
        tokio::time::sleep(Duration::from_millis(100)).await;
        bridge.on_set(PowerState::On);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(bridge.on_get(), PowerState::On);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
