use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::channel::{FRAME_PREFIX_LEN, MAX_DATAGRAM_PAYLOAD};
use crate::errors::{Result, ShmemError};
use crate::ring::LockKind;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64 * 1024 * 1024;
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring payload bytes, frame prefixes included.
    pub capacity: usize,
    pub lock: LockKind,
    /// Enables hybrid mode: payloads up to this many bytes travel inside a
    /// datagram instead of the ring.
    pub datagram_threshold: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            lock: LockKind::default(),
            datagram_threshold: None,
        }
    }
}

impl ChannelConfig {
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::default()
    }

    /// The small channel a generator's parent uses to send commands.
    pub fn commands() -> Self {
        ChannelConfig {
            capacity: DEFAULT_COMMAND_CAPACITY,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity <= FRAME_PREFIX_LEN {
            return Err(ShmemError::Logic(format!(
                "channel capacity must exceed the {}-byte frame prefix, got {}",
                FRAME_PREFIX_LEN, self.capacity
            )));
        }
        if let Some(threshold) = self.datagram_threshold {
            if threshold > MAX_DATAGRAM_PAYLOAD {
                return Err(ShmemError::Logic(format!(
                    "datagram threshold {} exceeds the maximum of {}",
                    threshold, MAX_DATAGRAM_PAYLOAD
                )));
            }
        }
        Ok(())
    }

    /// Loads and validates a TOML file. A missing file is created with the
    /// defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: ChannelConfig = confy::load_path(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default)]
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn lock(mut self, lock: LockKind) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn datagram_threshold(mut self, threshold: usize) -> Self {
        self.config.datagram_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> Result<ChannelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Channels owned by a [`crate::Thread`] or [`crate::Generator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub results: ChannelConfig,
    /// Only used by generators.
    pub commands: ChannelConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            results: ChannelConfig::default(),
            commands: ChannelConfig::commands(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        self.results.validate()?;
        self.commands.validate()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: WorkerConfig = confy::load_path(path)?;
        config.validate()?;
        Ok(config)
    }
}
