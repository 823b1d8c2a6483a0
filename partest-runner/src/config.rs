// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for partest.
//!
//! Configuration is read from a TOML file, layered on top of the defaults in
//! [`PartestConfig::DEFAULT_CONFIG`]. Settings are grouped into profiles: every profile falls back
//! to `[profile.default]` for anything it doesn't set.

use crate::errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound, WorkerCountParseError};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    num::NonZeroUsize,
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};
use tracing::warn;

/// Overall configuration for partest.
///
/// Most settings are managed through [profiles](PartestProfile), obtained through the
/// [`profile`](Self::profile) method.
#[derive(Clone, Debug)]
pub struct PartestConfig {
    inner: PartestConfigImpl,
}

impl PartestConfig {
    /// The default location of the config within a directory: `.config/partest.toml`.
    pub const CONFIG_PATH: &'static str = ".config/partest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/partest.toml` in
    /// `root`.
    ///
    /// An explicitly specified file must exist. If no file is specified and `root` doesn't have
    /// `.config/partest.toml`, the default config is used.
    pub fn from_sources(
        root: impl AsRef<Utf8Path>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.as_ref().join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (inner, ignored) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        warn_ignored(&config_file, &ignored);

        Ok(Self { inner })
    }

    /// Returns the default partest config.
    pub fn default_config() -> Self {
        let (inner, _) = Self::build_and_deserialize_config(&Self::make_default_config())
            .expect("default config is always valid");
        Self { inner }
    }

    /// Returns the profile with the given name, or an error if a profile was specified but not
    /// found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<PartestProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.profiles.get(name)?;
        Ok(PartestProfile {
            name: name.to_owned(),
            default_profile: &self.inner.profiles.default,
            custom_profile,
        })
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(PartestConfigImpl, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let inner: PartestConfigImpl = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| ConfigParseErrorKind::DeserializeError(Box::new(error)))?;

        Ok((inner, ignored))
    }
}

fn warn_ignored(config_file: &Utf8Path, ignored: &BTreeSet<String>) {
    if ignored.is_empty() {
        return;
    }
    let keys: Vec<_> = ignored.iter().map(String::as_str).collect();
    warn!(
        "ignoring unknown configuration keys in {config_file}: {}",
        keys.join(", ")
    );
}

/// A partest profile, which is a set of settings for a run.
///
/// Returned by [`PartestConfig::profile`].
#[derive(Clone, Debug)]
pub struct PartestProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl PartestProfile<'_> {
    /// Returns the name of this profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of workers to run for this profile.
    pub fn workers(&self) -> WorkerCount {
        self.custom_profile
            .and_then(|profile| profile.workers)
            .unwrap_or(self.default_profile.workers)
    }

    /// Returns true if the run should stop after the first failure.
    pub fn fail_fast(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.fail_fast)
            .unwrap_or(self.default_profile.fail_fast)
    }

    /// Returns true if per-test durations should be recorded.
    pub fn durations(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.durations)
            .unwrap_or(self.default_profile.durations)
    }

    /// Returns the number of events buffered per worker.
    pub fn channel_capacity(&self) -> NonZeroUsize {
        self.custom_profile
            .and_then(|profile| profile.channel_capacity)
            .unwrap_or(self.default_profile.channel_capacity)
    }

    /// Returns how long to wait for a worker to exit after asking it to.
    pub fn terminate_grace_period(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.terminate_grace_period)
            .unwrap_or(self.default_profile.terminate_grace_period)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PartestConfigImpl {
    #[serde(rename = "profile")]
    profiles: PartestProfilesImpl,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PartestProfilesImpl {
    default: DefaultProfileImpl,
    #[serde(flatten)]
    other: HashMap<String, CustomProfileImpl>,
}

impl PartestProfilesImpl {
    fn get(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            PartestConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profiles()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        self.other
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(PartestConfig::DEFAULT_PROFILE))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DefaultProfileImpl {
    workers: WorkerCount,
    fail_fast: bool,
    durations: bool,
    channel_capacity: NonZeroUsize,
    #[serde(with = "humantime_serde")]
    terminate_grace_period: Duration,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    workers: Option<WorkerCount>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(default)]
    durations: Option<bool>,
    #[serde(default)]
    channel_capacity: Option<NonZeroUsize>,
    #[serde(default, with = "humantime_serde")]
    terminate_grace_period: Option<Duration>,
}

/// Type for the workers config key and the `--workers` option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerCount {
    /// Run this many workers. Always at least 1.
    Count(usize),

    /// Run as many workers as there are logical CPUs.
    NumCpus,
}

impl WorkerCount {
    /// Gets the actual number of workers computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(workers) => workers,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = WorkerCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }
        match s.parse::<usize>() {
            Ok(workers) if workers > 0 => Ok(Self::Count(workers)),
            _ => Err(WorkerCountParseError::new(s)),
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(workers) => write!(f, "{workers}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = WorkerCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(WorkerCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // TOML integers are i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match usize::try_from(v) {
                    Ok(workers) if workers > 0 => Ok(WorkerCount::Count(workers)),
                    _ => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Signed(v),
                        &self,
                    )),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match usize::try_from(v) {
                    Ok(workers) if workers > 0 => Ok(WorkerCount::Count(workers)),
                    _ => Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Unsigned(v),
                        &self,
                    )),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Returns the number of logical CPUs, falling back to 1 if it can't be determined.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: OnceLock<usize> = OnceLock::new();

    *NUM_CPUS.get_or_init(|| match std::thread::available_parallelism() {
        Ok(count) => count.into(),
        Err(err) => {
            warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
            1
        }
    })
}

/// The directory config is read from when no explicit file is given: the current directory.
pub fn default_config_root() -> Utf8PathBuf {
    std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}
