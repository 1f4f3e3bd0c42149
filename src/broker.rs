//! Thin wrapper around `rumqttc::v5::AsyncClient`: connection setup with a last will, a handler
//! table scanned against every incoming publish (preserving multi-match fan-out rather than
//! first-match-wins), and the event-loop driving task. Grounded in the teacher's
//! `homie.rs::MqttClientExt`/`convert_qos` and its `tokio::select!`-driven `step` loop.

use homie5::client::QoS;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Filter, Packet, Publish};
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not publish to {1}")]
    Publish(#[source] rumqttc::v5::ClientError, String),
    #[error("could not subscribe to {1}")]
    Subscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("mqtt connection failed")]
    Connection(#[source] rumqttc::v5::ConnectionError),
    #[error("broker rejected the connection: {0:?}")]
    Rejected(ConnectReturnCode),
}

pub fn convert_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

pub type Handler = Arc<dyn Fn(&Publish) + Send + Sync>;

/// A single-level/multi-level MQTT topic filter matcher (`+` and `#` wildcards), used to route
/// each incoming publish to every matching handler.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(fs), Some(ts)) if fs == ts => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Holds the live MQTT client plus a scan-all handler table for topic dispatch.
pub struct Broker {
    client: AsyncClient,
    handlers: Vec<(String, Handler)>,
}

impl Broker {
    pub fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        last_will: Option<rumqttc::v5::mqttbytes::v5::LastWill>,
    ) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (username, password) {
            options.set_credentials(u, p);
        }
        if let Some(will) = last_will {
            options.set_last_will(will);
        }
        let (client, event_loop) = AsyncClient::new(options, 64);
        (Self { client, handlers: Vec::new() }, event_loop)
    }

    pub fn on(&mut self, filter: impl Into<String>, handler: Handler) {
        self.handlers.push((filter.into(), handler));
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), Error> {
        let topic = topic.into();
        let payload: Vec<u8> = payload.into();
        self.client
            .publish(topic.clone(), convert_qos(qos), retain, payload)
            .await
            .map_err(|e| Error::Publish(e, topic))
    }

    pub async fn subscribe(&self, filter: impl Into<String>, qos: QoS) -> Result<(), Error> {
        let filter = filter.into();
        self.client
            .subscribe(filter.clone(), convert_qos(qos))
            .await
            .map_err(|e| Error::Subscribe(e, filter))
    }

    pub async fn subscribe_many(&self, filters: impl Iterator<Item = (String, QoS)>) -> Result<(), Error> {
        self.client
            .subscribe_many(filters.map(|(topic, qos)| Filter::new(topic, convert_qos(qos))))
            .await
            .map_err(|e| Error::Subscribe(e, "(batch)".into()))
    }

    /// Dispatch one incoming publish to every handler whose filter matches. The original's
    /// registration table is scanned in full per message, not short-circuited at the first
    /// match, so overlapping subscriptions (e.g. a wildcard logger alongside a specific handler)
    /// both fire.
    pub fn dispatch(&self, publish: &Publish) {
        let Ok(topic) = std::str::from_utf8(&publish.topic) else { return };
        for (filter, handler) in &self.handlers {
            if topic_matches(filter, topic) {
                handler(publish);
            }
        }
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drives the event loop, dispatching every inbound publish, until the loop itself errors
    /// out (connection loss). The caller is expected to wrap this in a reconnect loop.
    pub async fn run(&self, mut event_loop: EventLoop) -> Result<(), Error> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish),
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code != ConnectReturnCode::Success => {
                    return Err(Error::Rejected(ack.code));
                }
                Ok(_) => {}
                Err(e) => return Err(Error::Connection(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches("tuya2mqtt/devices/+/set", "tuya2mqtt/devices/abc123/set"));
        assert!(!topic_matches("tuya2mqtt/devices/+/set", "tuya2mqtt/devices/abc123/x/set"));
    }

    #[test]
    fn hash_matches_remainder() {
        assert!(topic_matches("tuya2mqtt/#", "tuya2mqtt/bridge/status"));
        assert!(topic_matches("tuya2mqtt/#", "tuya2mqtt"));
    }

    #[test]
    fn overlapping_filters_both_match() {
        let mut broker_filters = vec!["tuya2mqtt/#", "tuya2mqtt/devices/+/set"];
        broker_filters.retain(|f| topic_matches(f, "tuya2mqtt/devices/abc/set"));
        assert_eq!(broker_filters.len(), 2);
    }
}
