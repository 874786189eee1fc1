use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        }
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    topics: Vec<String>,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, topics: Vec<String>) -> Self {
        Self {
            config,
            channels,
            topics,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        let mut options = MqttOptions::new(c.client_id(), c.host(), c.port());

        if let Some(topic) = c.lwt_topic() {
            let will = LastWill {
                topic: topic.clone(),
                message: bytes::Bytes::from("offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            };
            options.set_last_will(will);
        }

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        self.receiver(client, eventloop).await
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(());
    }

    // runs on every (re)connect, the broker forgets our subscriptions
    // when the session is clean
    async fn setup(&self, client: &AsyncClient) -> Result<()> {
        if let Some(topic) = self.config.mqtt().lwt_topic() {
            client
                .publish(topic, QoS::AtLeastOnce, true, "online")
                .await?;
        }

        for topic in &self.topics {
            info!("subscribing to {}", topic);
            client.subscribe(topic, QoS::AtMostOnce).await?;
        }

        Ok(())
    }

    // mqtt -> ingest
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        self.setup(&client).await?;
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.handle_message(&publish)?;
                    }
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in {:?}", RECONNECT_DELAY);
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = shutdown.recv() => {
                                info!("MQTT receiver shutting down while disconnected");
                                break;
                            }
                        }
                    }
                    _ => {} // keepalives etc
                },
                _ = shutdown.recv() => {
                    info!("MQTT receiver shutting down");
                    let _ = client.disconnect().await;
                    break;
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: &Publish) -> Result<()> {
        let message = Message::from_publish(publish);
        debug!("RX: {} = {:?}", message.topic, String::from_utf8_lossy(&message.payload));

        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }
}
