use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tuya_relay_bridge::bridge::{BridgeAdapter, PowerCharacteristic};
use tuya_relay_bridge::config::Config;
use tuya_relay_bridge::mirror::StateMirror;
use tuya_relay_bridge::mqtt::MqttFrontEnd;
use tuya_relay_bridge::relay::RelayClient;
use tuya_relay_bridge::tuya::client::TuyaClient;
use tuya_relay_bridge::tuya::{DeviceEvent, DpCommand};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting tuya-relay-bridge (device={} ({}) at {} v{}, relay={})",
        config.device.name,
        config.device.id,
        config.device.ip,
        config.device.version,
        config.relay.target.addr(),
    );
    match &config.mqtt {
        Some(mqtt) => info!(
            "  Front end: mqtt={}:{} prefix={}",
            mqtt.broker_host, mqtt.broker_port, mqtt.topic_prefix
        ),
        None => warn!("  Front end: disabled (MQTT_BROKER_HOST not set)"),
    }

    // Channels
    let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(100);
    let (cmd_tx, cmd_rx) = mpsc::channel::<DpCommand>(50);

    let mirror = Arc::new(StateMirror::default());
    let relay = RelayClient::new(config.relay.target.clone(), config.relay.connect_timeout);
    let mut bridge = BridgeAdapter::new(mirror.clone(), relay)
        .relay_device_reports(config.relay.relay_device_reports);
    if config.tuya.forward_commands {
        bridge = bridge.with_device_commands(cmd_tx);
    }

    let mut handles = Vec::new();

    // Device link
    let client = TuyaClient::new(config.device.clone(), config.tuya.discovery_timeout);
    let poll_interval = config.tuya.poll_interval;
    handles.push(tokio::spawn(async move {
        client.run(event_tx, cmd_rx, poll_interval).await;
    }));

    // Front end
    if let Some(mqtt_config) = &config.mqtt {
        let front_end = MqttFrontEnd::new(
            mqtt_config,
            &config.device.topic_name,
            config.accessory.clone(),
        );
        let handlers: Arc<dyn PowerCharacteristic> = Arc::new(bridge.clone());
        let state_rx = mirror.subscribe();
        let link_rx = bridge.subscribe_link();
        handles.push(tokio::spawn(async move {
            front_end.run(handlers, state_rx, link_rx).await;
        }));
    }

    // Device events into the bridge
    handles.push(tokio::spawn(bridge.run(event_rx)));

    wait_for_shutdown().await;

    // Cleanup
    for handle in handles {
        handle.abort();
    }
    info!("tuya-relay-bridge stopped");
}

async fn wait_for_shutdown() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, shutting down");
                }
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}
