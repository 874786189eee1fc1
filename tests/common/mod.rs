#![allow(dead_code)]

use fronius_meter_bridge::encoder::{PhasePower, Settings};
use fronius_meter_bridge::prelude::*;
use fronius_meter_bridge::register_table::Identity;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub const POWER: &str = "FSM/Leistung";
pub const IMPORT: &str = "FSM/Netzbezug_total";
pub const EXPORT: &str = "FSM/Netzeinspeisung_total";

pub fn common_setup() {
    fronius_meter_bridge::init_logging("debug");
}

pub struct Factory();
impl Factory {
    pub fn topics() -> HashMap<String, Channel> {
        HashMap::from([
            (POWER.to_string(), Channel::ActivePower),
            (IMPORT.to_string(), Channel::ImportEnergy),
            (EXPORT.to_string(), Channel::ExportEnergy),
        ])
    }

    pub fn engine() -> Arc<Engine> {
        let settings = Settings {
            energy_scaling: 1000,
            phase_power: PhasePower::EqualSplit,
        };
        Arc::new(Engine::new(Self::topics(), settings, &Identity::default()).unwrap())
    }
}

// a port nothing is listening on right now
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
