use crate::prelude::*;

use crate::encoder::{PhasePower, Settings};
use crate::register_table::{Identity, LiveBlock};
use crate::sample_store::Snapshot;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Stats {
    pub messages_accepted: u64,
    pub messages_rejected: u64,
    pub messages_ignored: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub modbus_reads: u64,
    pub modbus_rejected: u64,
}

impl Stats {
    pub fn print_summary(&self) {
        info!("Meter Statistics:");
        info!("  Telemetry messages accepted: {}", self.messages_accepted);
        info!("  Telemetry messages rejected: {}", self.messages_rejected);
        info!("  Telemetry messages ignored: {}", self.messages_ignored);
        info!("  Encoder cycles completed: {}", self.cycles_completed);
        info!("  Encoder cycles failed: {}", self.cycles_failed);
        info!("  Modbus reads served: {}", self.modbus_reads);
        info!("  Modbus requests rejected: {}", self.modbus_rejected);
    }
}

struct State {
    samples: SampleStore,
    registers: RegisterTable,
    stats: Stats,
}

/// Shared meter state: the sample store and register table behind a single
/// lock, plus the readiness signal.
///
/// One instance per process, handed to the ingest task, the scheduler and
/// the modbus server as an `Arc<Engine>`.
pub struct Engine {
    state: Mutex<State>,
    topics: HashMap<String, Channel>,
    settings: Settings,
    ready: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        topics: HashMap<String, Channel>,
        settings: Settings,
        identity: &Identity,
    ) -> Result<Self> {
        let (ready, _) = watch::channel(false);

        Ok(Self {
            state: Mutex::new(State {
                samples: SampleStore::new(),
                registers: RegisterTable::new(identity)?,
                stats: Stats::default(),
            }),
            topics,
            settings,
            ready,
        })
    }

    pub fn from_config(config: &ConfigWrapper) -> Result<Self> {
        let meter = config.meter();
        let topics = config.topics().bindings();

        let phase_power = if config.topics().all_phases_bound() {
            PhasePower::Measured
        } else {
            PhasePower::EqualSplit
        };

        let settings = Settings {
            energy_scaling: meter.energy_scaling(),
            phase_power,
        };

        Self::new(topics, settings, &meter.identity())
    }

    // The protected data is plain numbers that are consistent after every
    // operation, so a panic elsewhere doesn't make it unusable.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Ingest entry point, called once per inbound telemetry message.
    pub fn on_message(&self, topic: &str, payload: &[u8]) {
        let channel = match self.topics.get(topic) {
            Some(channel) => *channel,
            None => {
                trace!("ignoring message on unbound topic {}", topic);
                self.state().stats.messages_ignored += 1;
                return;
            }
        };

        let payload = String::from_utf8_lossy(payload);

        let now_ready = {
            let mut state = self.state();
            match state.samples.set(channel, &payload) {
                Ok(()) => {
                    state.stats.messages_accepted += 1;
                    debug!("{} = {} (from {})", channel, payload, topic);
                }
                Err(err) => {
                    state.stats.messages_rejected += 1;
                    warn!("{} on {}", err, topic);
                }
            }
            state.samples.is_ready()
        };

        if now_ready {
            self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state().samples.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the first non-zero energy sample has been accepted.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // the sender lives in self, so this can't fail
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// One encoder cycle: snapshot, encode, replace the live block, all under
    /// the lock. A failed encode leaves the previous registers in place.
    pub fn run_cycle(&self) -> Result<(), encoder::EncodeError> {
        let mut state = self.state();

        let snapshot = state.samples.snapshot();
        match encoder::live_block(&snapshot, &self.settings) {
            Ok(block) => {
                state.registers.write_live_block(&block);
                state.stats.cycles_completed += 1;
                Ok(())
            }
            Err(err) => {
                state.stats.cycles_failed += 1;
                Err(err)
            }
        }
    }

    pub fn read_registers(&self, start: u16, count: usize) -> Result<Vec<u16>> {
        let mut state = self.state();
        let words = state.registers.read(start, count)?;
        state.stats.modbus_reads += 1;
        Ok(words)
    }

    pub fn note_rejected_request(&self) {
        self.state().stats.modbus_rejected += 1;
    }

    pub fn live_block(&self) -> LiveBlock {
        self.state().registers.live_block()
    }

    pub fn stats(&self) -> Stats {
        self.state().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Float32Words;
    use crate::register_table::{live, LIVE_BLOCK_ADDRESS, LIVE_BLOCK_LENGTH};
    use std::time::Duration;

    fn engine(scaling: u32) -> Engine {
        let topics = HashMap::from([
            ("FSM/Leistung".to_string(), Channel::ActivePower),
            ("FSM/Netzbezug_total".to_string(), Channel::ImportEnergy),
            ("FSM/Netzeinspeisung_total".to_string(), Channel::ExportEnergy),
        ]);
        let settings = Settings {
            energy_scaling: scaling,
            phase_power: PhasePower::EqualSplit,
        };
        Engine::new(topics, settings, &Identity::default()).unwrap()
    }

    #[test]
    fn routes_by_topic() {
        let engine = engine(1);
        engine.on_message("FSM/Leistung", b"250.0");
        engine.on_message("FSM/Netzbezug_total", b"10");
        engine.on_message("some/other/topic", b"99");

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.get(Channel::ActivePower), 250.0);
        assert_eq!(snapshot.get(Channel::ImportEnergy), 10.0);
        assert_eq!(snapshot.get(Channel::ExportEnergy), 0.0);
        assert_eq!(snapshot.get(Channel::PhaseAPower), 0.0);

        let stats = engine.stats();
        assert_eq!(stats.messages_accepted, 2);
        assert_eq!(stats.messages_ignored, 1);
    }

    #[test]
    fn bad_payload_keeps_previous_value() {
        let engine = engine(1);
        engine.on_message("FSM/Leistung", b"100");
        engine.on_message("FSM/Leistung", b"not-a-number");
        engine.on_message("FSM/Leistung", &[0xff, 0xfe]);

        assert_eq!(engine.snapshot().get(Channel::ActivePower), 100.0);
        assert_eq!(engine.stats().messages_rejected, 2);
    }

    #[test]
    fn readiness_follows_energy_samples() {
        let engine = engine(1);
        engine.on_message("FSM/Leistung", b"100");
        engine.on_message("FSM/Netzbezug_total", b"0");
        assert!(!engine.is_ready());

        engine.on_message("FSM/Netzeinspeisung_total", b"1.5");
        assert!(engine.is_ready());
    }

    #[test]
    fn cycle_writes_scaled_energy() {
        let engine = engine(1000);
        engine.on_message("FSM/Netzeinspeisung_total", b"12.5");
        engine.run_cycle().unwrap();

        let words = engine
            .read_registers(LIVE_BLOCK_ADDRESS + live::TOTAL_EXPORTED as u16, 2)
            .unwrap();
        assert_eq!(words, vec![0x4643, 0xc800]);
    }

    #[test]
    fn repeated_cycles_are_identical() {
        let engine = engine(1000);
        engine.on_message("FSM/Leistung", b"-321.5");
        engine.on_message("FSM/Netzbezug_total", b"4711.123");

        engine.run_cycle().unwrap();
        let first = engine.read_registers(40000, 197).unwrap();
        engine.run_cycle().unwrap();
        let second = engine.read_registers(40000, 197).unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.stats().cycles_completed, 2);
    }

    #[test]
    fn failed_cycle_keeps_previous_registers() {
        let engine = engine(1000);
        engine.on_message("FSM/Leistung", b"250");
        engine.on_message("FSM/Netzbezug_total", b"1");
        engine.run_cycle().unwrap();
        let before = engine.live_block();

        // 1e36 * 1000 no longer fits an f32
        engine.on_message("FSM/Netzbezug_total", b"1e36");
        engine.on_message("FSM/Leistung", b"500");
        assert!(engine.run_cycle().is_err());

        assert_eq!(engine.live_block(), before);
        assert_eq!(engine.live_block()[live::TOTAL_POWER], Float32Words::encode(250.0).hi);
        assert_eq!(engine.stats().cycles_failed, 1);
    }

    #[test]
    fn readers_never_see_a_half_written_block() {
        let engine = engine(1);
        let states = [(b"100", b"1"), (b"200", b"2")];

        let expected = |power: f32, export: f32| {
            let mut words = vec![Float32Words::encode(power).hi, 0];
            words.extend(Float32Words::encode(export).registers());
            words
        };
        let consistent = [
            expected(0.0, 0.0),
            expected(100.0, 1.0),
            expected(200.0, 2.0),
        ];

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..2000 {
                    let (power, export) = states[i % 2];
                    engine.on_message("FSM/Leistung", power);
                    engine.on_message("FSM/Netzeinspeisung_total", export);
                    engine.run_cycle().unwrap();
                }
            });

            for _ in 0..2000 {
                let block = engine
                    .read_registers(LIVE_BLOCK_ADDRESS, LIVE_BLOCK_LENGTH)
                    .unwrap();
                let mut seen = block[live::TOTAL_POWER..live::TOTAL_POWER + 2].to_vec();
                seen.extend_from_slice(&block[live::TOTAL_EXPORTED..live::TOTAL_EXPORTED + 2]);

                assert!(consistent.contains(&seen), "inconsistent read {:04x?}", seen);
            }
        });

        assert_eq!(engine.stats().cycles_completed, 2000);
    }

    #[tokio::test]
    async fn wait_ready_blocks_until_energy_arrives() {
        let engine = std::sync::Arc::new(engine(1));

        let waiting = tokio::time::timeout(Duration::from_millis(50), engine.wait_ready()).await;
        assert!(waiting.is_err());

        let e = engine.clone();
        let waiter = tokio::spawn(async move { e.wait_ready().await });

        engine.on_message("FSM/Netzbezug_total", b"3.2");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate did not open")
            .unwrap();
        // already open, returns straight away
        engine.wait_ready().await;
    }
}
