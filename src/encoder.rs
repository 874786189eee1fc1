use crate::register_table::{live, LiveBlock, LIVE_BLOCK_LENGTH};
use crate::sample_store::{Channel, Snapshot};

use std::fmt;

/// The two halves of an IEEE-754 single precision bit pattern.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Float32Words {
    pub lo: u16,
    pub hi: u16,
}

impl Float32Words {
    pub fn encode(value: f32) -> Self {
        let bits = value.to_bits();
        Self {
            lo: (bits & 0xffff) as u16,
            hi: (bits >> 16) as u16,
        }
    }

    pub fn decode(&self) -> f32 {
        f32::from_bits(((self.hi as u32) << 16) | self.lo as u32)
    }

    // register order on the wire: most significant half first
    pub fn registers(&self) -> [u16; 2] {
        [self.hi, self.lo]
    }

    // instantaneous power fields only carry the leading register, the meter
    // leaves the trailing one at zero
    pub fn truncated_registers(&self) -> [u16; 2] {
        [self.hi, 0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodeError {
    NonFinite { quantity: &'static str, value: f64 },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::NonFinite { quantity, value } => {
                write!(f, "{} = {} does not fit a 32-bit float", quantity, value)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhasePower {
    /// each phase is fed from its own topic
    Measured,
    /// each phase gets a third of the total
    EqualSplit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Settings {
    pub energy_scaling: u32,
    pub phase_power: PhasePower,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            energy_scaling: 1,
            phase_power: PhasePower::EqualSplit,
        }
    }
}

/// Values as they end up on the wire, before splitting into registers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Readings {
    pub total_power: f32,
    pub phase_power: [f32; 3],
    pub exported: f32,
    pub imported: f32,
}

impl Readings {
    pub fn from_snapshot(snapshot: &Snapshot, settings: &Settings) -> Result<Self, EncodeError> {
        let total = snapshot.get(Channel::ActivePower);

        let phases = match settings.phase_power {
            PhasePower::Measured => [
                snapshot.get(Channel::PhaseAPower),
                snapshot.get(Channel::PhaseBPower),
                snapshot.get(Channel::PhaseCPower),
            ],
            PhasePower::EqualSplit => [total / 3.0; 3],
        };

        Ok(Self {
            total_power: to_f32("active power", total)?,
            phase_power: [
                to_f32("phase A power", phases[0])?,
                to_f32("phase B power", phases[1])?,
                to_f32("phase C power", phases[2])?,
            ],
            exported: to_f32(
                "exported energy",
                scale_energy(snapshot.get(Channel::ExportEnergy), settings.energy_scaling),
            )?,
            imported: to_f32(
                "imported energy",
                scale_energy(snapshot.get(Channel::ImportEnergy), settings.energy_scaling),
            )?,
        })
    }
}

/// Applies the configured factor, then drops the fractional part.
pub fn scale_energy(raw: f64, scaling: u32) -> f64 {
    (raw * scaling as f64).trunc()
}

fn to_f32(quantity: &'static str, value: f64) -> Result<f32, EncodeError> {
    let narrowed = value as f32;
    if narrowed.is_finite() {
        Ok(narrowed)
    } else {
        Err(EncodeError::NonFinite { quantity, value })
    }
}

/// Builds the complete live block for one cycle. Fields the telemetry doesn't
/// cover stay zero.
pub fn live_block(snapshot: &Snapshot, settings: &Settings) -> Result<LiveBlock, EncodeError> {
    let readings = Readings::from_snapshot(snapshot, settings)?;

    let mut block = [0; LIVE_BLOCK_LENGTH];
    let mut put = |offset: usize, words: [u16; 2]| {
        block[offset..offset + 2].copy_from_slice(&words);
    };

    put(
        live::TOTAL_POWER,
        Float32Words::encode(readings.total_power).truncated_registers(),
    );
    for (offset, power) in [live::PHASE_A_POWER, live::PHASE_B_POWER, live::PHASE_C_POWER]
        .into_iter()
        .zip(readings.phase_power)
    {
        put(offset, Float32Words::encode(power).truncated_registers());
    }
    put(live::TOTAL_EXPORTED, Float32Words::encode(readings.exported).registers());
    put(live::TOTAL_IMPORTED, Float32Words::encode(readings.imported).registers());

    Ok(block)
}
