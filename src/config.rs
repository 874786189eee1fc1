use crate::prelude::*;

use crate::register_table::{Identity, MeterVariant, STRING_FIELD_WORDS};

use serde::Deserialize;
use serde_yaml;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub mqtt: Mqtt,

    #[serde(default)]
    pub topics: Topics,

    #[serde(default)]
    pub meter: Meter,

    #[serde(default)]
    pub modbus: Modbus,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_client_id")]
    pub client_id: String,

    #[serde(default, deserialize_with = "de_topic")]
    pub lwt_topic: Option<String>,
}
impl Mqtt {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn lwt_topic(&self) -> &Option<String> {
        &self.lwt_topic
    }
} // }}}

// Topics {{{
/// Which MQTT topic feeds which channel. An empty or missing topic leaves
/// the channel unbound, it then always reads as zero (or, for the phases,
/// is derived from the total).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Topics {
    #[serde(default, deserialize_with = "de_topic")]
    pub active_power: Option<String>,
    #[serde(default, deserialize_with = "de_topic")]
    pub import_energy: Option<String>,
    #[serde(default, deserialize_with = "de_topic")]
    pub export_energy: Option<String>,
    #[serde(default, deserialize_with = "de_topic")]
    pub phase_a_power: Option<String>,
    #[serde(default, deserialize_with = "de_topic")]
    pub phase_b_power: Option<String>,
    #[serde(default, deserialize_with = "de_topic")]
    pub phase_c_power: Option<String>,
}
impl Topics {
    pub fn topic(&self, channel: Channel) -> &Option<String> {
        match channel {
            Channel::ActivePower => &self.active_power,
            Channel::ImportEnergy => &self.import_energy,
            Channel::ExportEnergy => &self.export_energy,
            Channel::PhaseAPower => &self.phase_a_power,
            Channel::PhaseBPower => &self.phase_b_power,
            Channel::PhaseCPower => &self.phase_c_power,
        }
    }

    pub fn bindings(&self) -> HashMap<String, Channel> {
        Channel::ALL
            .into_iter()
            .filter_map(|channel| self.topic(channel).clone().map(|topic| (topic, channel)))
            .collect()
    }

    pub fn all_phases_bound(&self) -> bool {
        self.phase_a_power.is_some() && self.phase_b_power.is_some() && self.phase_c_power.is_some()
    }
} // }}}

// Meter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Meter {
    #[serde(default = "Config::default_energy_scaling")]
    pub energy_scaling: u32,
    #[serde(default = "Config::default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "Config::default_serial")]
    pub serial: String,
    #[serde(default = "Config::default_device_address")]
    pub device_address: u16,
    #[serde(default)]
    pub variant: MeterVariant,
}
impl Default for Meter {
    fn default() -> Self {
        Self {
            energy_scaling: Config::default_energy_scaling(),
            update_interval_secs: Config::default_update_interval_secs(),
            serial: Config::default_serial(),
            device_address: Config::default_device_address(),
            variant: MeterVariant::default(),
        }
    }
}
impl Meter {
    pub fn energy_scaling(&self) -> u32 {
        self.energy_scaling
    }

    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.update_interval_secs)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            serial: self.serial.clone(),
            device_address: self.device_address,
            variant: self.variant,
        }
    }
} // }}}

// Modbus {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Modbus {
    #[serde(default = "Config::default_modbus_listen")]
    pub listen: String,
    #[serde(default = "Config::default_modbus_port")]
    pub port: u16,
    #[serde(default = "Config::default_modbus_unit_id")]
    pub unit_id: u8,
}
impl Default for Modbus {
    fn default() -> Self {
        Self {
            listen: Config::default_modbus_listen(),
            port: Config::default_modbus_port(),
            unit_id: Config::default_modbus_unit_id(),
        }
    }
}
impl Modbus {
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        let ip: std::net::IpAddr = self
            .listen
            .parse()
            .map_err(|err| anyhow!("config.rs:invalid modbus.listen {}: {}", self.listen, err))?;
        Ok(std::net::SocketAddr::new(ip, self.port))
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn config(&self) -> std::sync::MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mqtt(&self) -> Mqtt {
        self.config().mqtt.clone()
    }

    pub fn topics(&self) -> Topics {
        self.config().topics.clone()
    }

    pub fn meter(&self) -> Meter {
        self.config().meter.clone()
    }

    pub fn modbus(&self) -> Modbus {
        self.config().modbus.clone()
    }

    pub fn loglevel(&self) -> String {
        self.config().loglevel.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        let config = Self::from_yaml(&content)?;

        info!("Configuration loaded successfully:");
        info!("  MQTT:");
        info!("    Host: {}", config.mqtt.host);
        info!("    Port: {}", config.mqtt.port);
        info!("    Client ID: {}", config.mqtt.client_id);
        info!("    Username: {}", config.mqtt.username.as_deref().unwrap_or(""));
        if let Some(lwt) = &config.mqtt.lwt_topic {
            info!("    LWT Topic: {}", lwt);
        }
        info!("  Topics:");
        for channel in Channel::ALL {
            info!(
                "    {}: {}",
                channel,
                config.topics.topic(channel).as_deref().unwrap_or("(unbound)")
            );
        }
        info!("  Meter:");
        info!("    Variant: {}", config.meter.variant.model());
        info!("    Serial: {}", config.meter.serial);
        info!("    Device Address: {}", config.meter.device_address);
        info!("    Energy Scaling: {}", config.meter.energy_scaling);
        info!("    Update Interval: {}s", config.meter.update_interval_secs);
        info!(
            "    Phase Power: {}",
            if config.topics.all_phases_bound() { "measured" } else { "equal split" }
        );
        info!("  Modbus:");
        info!("    Listen: {}:{}", config.modbus.listen, config.modbus.port);
        info!("    Unit ID: {}", config.modbus.unit_id);
        info!("  Log Level: {}", config.loglevel);

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.port == 0 {
            bail!("mqtt.port must be between 1 and 65535");
        }
        if self.mqtt.host.is_empty() {
            return Err(anyhow!("config.rs:MQTT host cannot be empty"));
        }

        if self.modbus.port == 0 {
            bail!("modbus.port must be between 1 and 65535");
        }
        self.modbus.socket_addr()?;

        if self.meter.energy_scaling == 0 {
            bail!("meter.energy_scaling must be at least 1");
        }
        if self.meter.update_interval_secs == 0 {
            bail!("meter.update_interval_secs must be at least 1");
        }
        if !self.meter.serial.is_ascii() || self.meter.serial.len() > STRING_FIELD_WORDS {
            bail!(
                "meter.serial must be at most {} ASCII characters",
                STRING_FIELD_WORDS
            );
        }

        let mut seen: HashMap<&str, Channel> = HashMap::new();
        for channel in Channel::ALL {
            if let Some(topic) = self.topics.topic(channel) {
                if let Some(other) = seen.insert(topic, channel) {
                    bail!("topic {} is bound to both {} and {}", topic, other, channel);
                }
            }
        }

        if self.topics.import_energy.is_none() && self.topics.export_energy.is_none() {
            bail!("at least one of topics.import_energy and topics.export_energy must be set");
        }

        Ok(())
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_client_id() -> String {
        "fronius-meter-bridge".to_string()
    }

    fn default_energy_scaling() -> u32 {
        1
    }

    fn default_update_interval_secs() -> u64 {
        5
    }

    fn default_serial() -> String {
        "00000001".to_string()
    }

    fn default_device_address() -> u16 {
        240
    }

    fn default_modbus_listen() -> String {
        "0.0.0.0".to_string()
    }

    fn default_modbus_port() -> u16 {
        502
    }

    fn default_modbus_unit_id() -> u8 {
        1
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

// empty string means unbound
fn de_topic<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.filter(|s| !s.trim().is_empty()))
}
