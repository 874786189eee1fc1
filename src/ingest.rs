use crate::prelude::*;

use std::sync::Arc;

/// Feeds every message the MQTT client receives into the engine.
pub struct Ingest {
    engine: Arc<Engine>,
    channels: Channels,
}

impl Ingest {
    pub fn new(engine: Arc<Engine>, channels: Channels) -> Self {
        Self { engine, channels }
    }

    /// Subscribe before the MQTT client starts, or early messages are lost.
    pub fn subscribe(&self) -> broadcast::Receiver<mqtt::ChannelData> {
        self.channels.from_mqtt.subscribe()
    }

    pub async fn start(&self, mut receiver: broadcast::Receiver<mqtt::ChannelData>) -> Result<()> {
        use broadcast::error::RecvError;

        debug!("ingest starting");

        loop {
            match receiver.recv().await {
                Ok(mqtt::ChannelData::Message(message)) => {
                    self.engine.on_message(&message.topic, &message.payload);
                }
                Ok(mqtt::ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                // only the latest value per channel matters
                Err(RecvError::Lagged(n)) => warn!("ingest lagged, skipped {} messages", n),
            }
        }

        debug!("ingest exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
    }
}
