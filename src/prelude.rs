pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::broadcast;

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::encoder;
pub use crate::engine::{Engine, Stats};
pub use crate::mqtt;
pub use crate::options::Options;
pub use crate::register_table::{self, RegisterTable};
pub use crate::sample_store::{self, Channel, SampleStore};
