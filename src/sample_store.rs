use std::fmt;

/// Telemetry channels the meter can be fed from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Channel {
    ActivePower,
    ImportEnergy,
    ExportEnergy,
    PhaseAPower,
    PhaseBPower,
    PhaseCPower,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::ActivePower,
        Channel::ImportEnergy,
        Channel::ExportEnergy,
        Channel::PhaseAPower,
        Channel::PhaseBPower,
        Channel::PhaseCPower,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn is_energy(self) -> bool {
        matches!(self, Channel::ImportEnergy | Channel::ExportEnergy)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::ActivePower => "active_power",
            Channel::ImportEnergy => "import_energy",
            Channel::ExportEnergy => "export_energy",
            Channel::PhaseAPower => "phase_a_power",
            Channel::PhaseBPower => "phase_b_power",
            Channel::PhaseCPower => "phase_c_power",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleError {
    Rejected { channel: Channel, payload: String },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Rejected { channel, payload } => {
                write!(f, "rejected non-numeric payload {:?} for {}", payload, channel)
            }
        }
    }
}

impl std::error::Error for SampleError {}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub valid: bool,
}

/// Point-in-time copy of every channel value; invalid channels read as 0.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Snapshot {
    values: [f64; 6],
}

impl Snapshot {
    pub fn get(&self, channel: Channel) -> f64 {
        self.values[channel.index()]
    }

    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.values[channel.index()] = value;
        self
    }
}

/// Latest accepted value per channel plus the one-way readiness flag.
///
/// Not synchronised on its own, the engine keeps it behind its lock.
#[derive(Debug, Default)]
pub struct SampleStore {
    samples: [Sample; 6],
    ready: bool,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `payload` as a number and stores it for `channel`.
    ///
    /// Anything that isn't a finite decimal number is rejected and leaves the
    /// previous value untouched.
    pub fn set(&mut self, channel: Channel, payload: &str) -> Result<(), SampleError> {
        let value = match payload.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                return Err(SampleError::Rejected {
                    channel,
                    payload: payload.to_owned(),
                })
            }
        };

        self.samples[channel.index()] = Sample { value, valid: true };

        if channel.is_energy() && value != 0.0 {
            self.ready = true;
        }

        Ok(())
    }

    pub fn get(&self, channel: Channel) -> Sample {
        self.samples[channel.index()]
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut values = [0.0; 6];
        for (value, sample) in values.iter_mut().zip(self.samples.iter()) {
            if sample.valid {
                *value = sample.value;
            }
        }
        Snapshot { values }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}
