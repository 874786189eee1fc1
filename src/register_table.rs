use crate::prelude::*;

use serde::Deserialize;

// the meter answers for 40000..=40196
pub const BASE_ADDRESS: u16 = 40000;
pub const REGISTER_COUNT: usize = 197;

pub const COMMON_MODEL_ID: u16 = 1;
pub const COMMON_MODEL_LENGTH: u16 = 65;
pub const METER_MODEL_ID: u16 = 213;
pub const METER_MODEL_LENGTH: u16 = 124;

pub const MANUFACTURER_ADDRESS: u16 = 40004;
pub const MODEL_ADDRESS: u16 = 40020;
pub const SERIAL_ADDRESS: u16 = 40052;
pub const DEVICE_ADDRESS_ADDRESS: u16 = 40068;
pub const LIVE_BLOCK_ADDRESS: u16 = 40071;
pub const LIVE_BLOCK_LENGTH: usize = METER_MODEL_LENGTH as usize;
pub const END_MARKER_ADDRESS: u16 = 40195;

pub const STRING_FIELD_WORDS: usize = 16;

const MANUFACTURER: &str = "Fronius";

/// Offsets of the telemetry driven fields inside the live block.
pub mod live {
    pub const TOTAL_POWER: usize = 26;
    pub const PHASE_A_POWER: usize = 28;
    pub const PHASE_B_POWER: usize = 30;
    pub const PHASE_C_POWER: usize = 32;
    pub const TOTAL_EXPORTED: usize = 58;
    pub const TOTAL_IMPORTED: usize = 66;
}

pub type LiveBlock = [u16; LIVE_BLOCK_LENGTH];

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum MeterVariant {
    #[default]
    #[serde(rename = "smart_meter_63a")]
    SmartMeter63a,
    #[serde(rename = "smart_meter_ts_65a_3")]
    SmartMeterTs65a3,
}

impl MeterVariant {
    pub fn model(&self) -> &'static str {
        match self {
            MeterVariant::SmartMeter63a => "Smart Meter 63A",
            MeterVariant::SmartMeterTs65a3 => "TS 65A-3",
        }
    }
}

/// Values the identification block is stamped with.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub serial: String,
    pub device_address: u16,
    pub variant: MeterVariant,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            serial: "00000001".to_string(),
            device_address: 240,
            variant: MeterVariant::default(),
        }
    }
}

/// The meter's whole address space.
///
/// Everything outside the live block is written once by `new` and never
/// changes. Callers share it through the engine's lock, so a live block write
/// is seen by readers either completely or not at all.
#[derive(Clone, Debug)]
pub struct RegisterTable {
    registers: [u16; REGISTER_COUNT],
}

impl RegisterTable {
    /// Fails if a string of the identity doesn't fit its field.
    pub fn new(identity: &Identity) -> Result<Self> {
        let mut table = Self {
            registers: [0; REGISTER_COUNT],
        };

        table.put(BASE_ADDRESS, &[0x5375, 0x6e53]); // "SunS"
        table.put(BASE_ADDRESS + 2, &[COMMON_MODEL_ID, COMMON_MODEL_LENGTH]);
        table.put(MANUFACTURER_ADDRESS, &string_words(MANUFACTURER)?);
        table.put(MODEL_ADDRESS, &string_words(identity.variant.model())?);
        table.put(SERIAL_ADDRESS, &string_words(&identity.serial)?);
        table.put(DEVICE_ADDRESS_ADDRESS, &[identity.device_address]);
        table.put(LIVE_BLOCK_ADDRESS - 2, &[METER_MODEL_ID, METER_MODEL_LENGTH]);
        table.put(END_MARKER_ADDRESS, &[0xffff, 0x0000]);

        Ok(table)
    }

    fn put(&mut self, address: u16, words: &[u16]) {
        let start = (address - BASE_ADDRESS) as usize;
        self.registers[start..start + words.len()].copy_from_slice(words);
    }

    fn range(start: u16, count: usize) -> Option<std::ops::Range<usize>> {
        let offset = start.checked_sub(BASE_ADDRESS)? as usize;
        let end = offset.checked_add(count)?;
        if end > REGISTER_COUNT {
            return None;
        }
        Some(offset..end)
    }

    pub fn contains(start: u16, count: usize) -> bool {
        Self::range(start, count).is_some()
    }

    /// `count` words from `start`, or an error if any of them is outside the
    /// table.
    pub fn read(&self, start: u16, count: usize) -> Result<Vec<u16>> {
        match Self::range(start, count) {
            Some(range) => Ok(self.registers[range].to_vec()),
            None => bail!("read of {} registers at {} is outside the meter map", count, start),
        }
    }

    /// Writes into the live block. Anything touching the identification block
    /// is refused.
    pub fn write(&mut self, start: u16, words: &[u16]) -> Result<()> {
        let live_end = LIVE_BLOCK_ADDRESS as usize + LIVE_BLOCK_LENGTH;
        if start < LIVE_BLOCK_ADDRESS || start as usize + words.len() > live_end {
            bail!(
                "write of {} registers at {} is outside the live block",
                words.len(),
                start
            );
        }
        self.put(start, words);
        Ok(())
    }

    pub fn write_live_block(&mut self, block: &LiveBlock) {
        self.put(LIVE_BLOCK_ADDRESS, block);
    }

    pub fn live_block(&self) -> LiveBlock {
        let mut block = [0; LIVE_BLOCK_LENGTH];
        let start = (LIVE_BLOCK_ADDRESS - BASE_ADDRESS) as usize;
        block.copy_from_slice(&self.registers[start..start + LIVE_BLOCK_LENGTH]);
        block
    }
}

// one ASCII byte per register, NUL padded
fn string_words(s: &str) -> Result<[u16; STRING_FIELD_WORDS]> {
    if !s.is_ascii() || s.len() > STRING_FIELD_WORDS {
        bail!(
            "{:?} does not fit a string field of {} ASCII characters",
            s,
            STRING_FIELD_WORDS
        );
    }

    let mut words = [0; STRING_FIELD_WORDS];
    for (word, byte) in words.iter_mut().zip(s.bytes()) {
        *word = byte as u16;
    }
    Ok(words)
}
