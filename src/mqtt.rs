use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::broadcast;

use crate::{
    config,
    engine::{OccupancySink, ReasonSink},
    messages::{EngineCommand, PayloadError},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
    retained: Arc<Mutex<RetainedOutputs>>,
}

/// Last values handed to the sinks, and which of them still have to reach the broker.
#[derive(Debug, Default)]
struct RetainedOutputs {
    occupied: Option<bool>,
    reason: Option<String>,
    occupied_pending: bool,
    reason_pending: bool,
}

impl RetainedOutputs {
    fn set_occupied(&mut self, occupied: bool) {
        self.occupied = Some(occupied);
        self.occupied_pending = true;
    }

    fn set_reason(&mut self, reason: &str) {
        self.reason = Some(reason.to_string());
        self.reason_pending = true;
    }

    // A new session gets everything again, whether or not it was sent before.
    fn mark_all_pending(&mut self) {
        self.occupied_pending = self.occupied.is_some();
        self.reason_pending = self.reason.is_some();
    }

    fn is_pending(&self) -> bool {
        self.occupied_pending || self.reason_pending
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"bed-presence-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or("bed_presence".to_string()),
                retained: Arc::new(Mutex::new(RetainedOutputs::default())),
            },
            eventloop,
        )
    }

    // Called from inside the event loop, so it must not wait on queue space.
    fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .try_subscribe_many(vec![
                SubscribeFilter::new(format!("{}/energy", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(
                    format!("{}/calibrate/thresholds", self.topic_path),
                    QoS::AtLeastOnce,
                ),
                SubscribeFilter::new(
                    format!("{}/calibrate/debounce", self.topic_path),
                    QoS::AtLeastOnce,
                ),
            ])?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<EngineCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let command = match route_message(&self.topic_path, &p.topic, &p.payload)
                        {
                            Some(Ok(command)) => command,
                            Some(Err(err)) => {
                                warn!("Dropping message on {}: {}", p.topic, err);
                                continue;
                            }
                            None => continue,
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                        self.retained.lock().mark_all_pending();
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }

            // Each poll frees queue space, so retry whatever was dropped.
            if let Err(err) = self.flush_retained() {
                debug!("Retained outputs still queued: {:?}", err);
            }
        }
    }

    fn output_topic(&self, leaf: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            sanitize_name(&self.publisher_id),
            leaf
        )
    }

    // Non-blocking so the engine can call it from its synchronous tick.
    // Anything that doesn't fit in the request queue stays pending for the event loop.
    fn flush_retained(&self) -> Result<(), rumqttc::ClientError> {
        let mut retained = self.retained.lock();
        if !retained.is_pending() {
            return Ok(());
        }

        if retained.occupied_pending {
            if let Some(occupied) = retained.occupied {
                let payload = if occupied { "ON" } else { "OFF" };
                self.client.try_publish(
                    self.output_topic("occupied"),
                    QoS::AtLeastOnce,
                    true,
                    payload,
                )?;
            }
            retained.occupied_pending = false;
        }

        if retained.reason_pending {
            if let Some(reason) = retained.reason.as_deref() {
                self.client.try_publish(
                    self.output_topic("state_reason"),
                    QoS::AtLeastOnce,
                    true,
                    reason,
                )?;
            }
            retained.reason_pending = false;
        }

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl OccupancySink for MqttClient {
    fn publish_occupancy(&self, occupied: bool) {
        self.retained.lock().set_occupied(occupied);
        if let Err(err) = self.flush_retained() {
            warn!("Occupancy publish deferred until the queue drains: {:?}", err);
        }
    }
}

impl ReasonSink for MqttClient {
    fn publish_reason(&self, reason: &str) {
        self.retained.lock().set_reason(reason);
        if let Err(err) = self.flush_retained() {
            warn!("State reason publish deferred until the queue drains: {:?}", err);
        }
    }
}

/// Maps an incoming publish to a command. `None` for topics we don't handle.
fn route_message(
    topic_path: &str,
    topic: &str,
    payload: &[u8],
) -> Option<Result<EngineCommand, PayloadError>> {
    let leaf = topic.strip_prefix(topic_path)?.strip_prefix('/')?;
    match leaf {
        "energy" => Some(EngineCommand::energy_from_payload(payload)),
        "calibrate/thresholds" => Some(EngineCommand::thresholds_from_payload(payload)),
        "calibrate/debounce" => Some(EngineCommand::debounce_from_payload(payload)),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
