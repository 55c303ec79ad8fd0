//! Configuration of a [`crate::TimeSeriesEngine`]
//!
//! Configuration is read from YAML. A configuration that parses but describes
//! an invalid rollup set is rejected at load, not at first use.

use std::{
    fs,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    rollup::{self, Retention, Rollup, Rollups},
    store::default_shards,
};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading the configuration file.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The configured rollups are invalid.
    #[error(transparent)]
    Rollup(#[from] rollup::Error),
}

/// One configured rollup
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RollupConfig {
    /// Bucket width, in seconds
    pub width_seconds: NonZeroU64,
    /// History kept at this width
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub retention: Retention,
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of lock shards per aggregate store
    #[serde(default = "default_shards")]
    pub shards: NonZeroUsize,
    /// The rollups every write lands in, any order
    pub rollups: Vec<RollupConfig>,
}

impl Default for Config {
    /// Ten second buckets for an hour, hourly buckets for a week and daily
    /// buckets for ninety days.
    fn default() -> Self {
        let rollup = |width: u64, samples: u32| -> Option<RollupConfig> {
            Some(RollupConfig {
                width_seconds: NonZeroU64::new(width)?,
                retention: Retention::Samples(NonZeroU32::new(samples)?),
            })
        };
        Self {
            shards: default_shards(),
            rollups: [rollup(10, 360), rollup(3600, 24 * 7), rollup(86_400, 90)]
                .into_iter()
                .flatten()
                .collect(),
        }
    }
}

impl Config {
    /// Load and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML for a
    /// [`Config`] or describes an invalid rollup set.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// The validated rollup set this configuration describes.
    ///
    /// # Errors
    ///
    /// See [`Rollups::new`] and [`Retention::samples`].
    pub fn rollups(&self) -> Result<Rollups, rollup::Error> {
        Rollups::try_from(self)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = serde_yaml::from_str(s)?;
        config.rollups()?;
        Ok(config)
    }
}

impl TryFrom<&Config> for Rollups {
    type Error = rollup::Error;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let rollups = config
            .rollups
            .iter()
            .map(|rollup| Rollup::with_retention(rollup.width_seconds, rollup.retention))
            .collect::<Result<Vec<_>, _>>()?;
        Rollups::new(rollups)
    }
}
