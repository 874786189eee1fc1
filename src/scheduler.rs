use crate::prelude::*;

use std::sync::Arc;
use std::time::Duration;

/// Runs the encoder on a fixed period. The next cycle is only armed once the
/// previous one has finished, so cycles never overlap.
pub struct Scheduler {
    engine: Arc<Engine>,
    channels: Channels,
    period: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, channels: Channels, period: Duration) -> Self {
        Self {
            engine,
            channels,
            period,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.channels.to_scheduler.subscribe();

        info!("encoder running every {:?}", self.period);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => self.tick(),
                _ = shutdown.recv() => break,
            }
        }

        debug!("scheduler exiting");
        Ok(())
    }

    pub fn tick(&self) {
        match self.engine.run_cycle() {
            Ok(()) => {
                let s = self.engine.snapshot();
                debug!(
                    "registers updated: power={}W import={} export={}",
                    s.get(Channel::ActivePower),
                    s.get(Channel::ImportEnergy),
                    s.get(Channel::ExportEnergy)
                );
            }
            Err(err) => warn!("encoder cycle skipped, keeping previous registers: {}", err),
        }
    }

    pub fn stop(&self) {
        let _ = self.channels.to_scheduler.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Float32Words, Settings};
    use crate::register_table::{live, Identity};
    use std::collections::HashMap;

    fn engine() -> Arc<Engine> {
        let topics = HashMap::from([("power".to_string(), Channel::ActivePower)]);
        Arc::new(Engine::new(topics, Settings::default(), &Identity::default()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn updates_registers_every_period() {
        let engine = engine();
        let channels = Channels::new();
        let scheduler = Arc::new(Scheduler::new(engine.clone(), channels, Duration::from_secs(5)));

        engine.on_message("power", b"250");

        let s = scheduler.clone();
        let handle = tokio::spawn(async move { s.start().await });

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(engine.stats().cycles_completed, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(engine.live_block()[live::TOTAL_POWER], Float32Words::encode(250.0).hi);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.stats().cycles_completed, 3);

        scheduler.stop();
        handle.await.unwrap().unwrap();
    }
}
