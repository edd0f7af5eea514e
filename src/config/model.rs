// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::DispatchPolicy;
use crate::types::{ProviderKind, StoreMode};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [store]
/// mode = "file"
/// root = ".launchpad/artifacts"
/// retention = "168h"
///
/// [dispatch]
/// provision_attempts = 5
/// provision_base_delay = "1s"
/// provision_max_delay = "30s"
/// start_timeout = "30s"
///
/// [tracker]
/// journal = ".launchpad/jobs.jsonl"
///
/// [provider]
/// kind = "local"
/// root = ".launchpad/envs"
/// ```
///
/// All sections are optional and have reasonable defaults. Durations are
/// strings with a unit suffix: `ms`, `s`, `m` or `h`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub store: RawStoreSection,

    #[serde(default)]
    pub dispatch: RawDispatchSection,

    #[serde(default)]
    pub tracker: RawTrackerSection,

    #[serde(default)]
    pub provider: RawProviderSection,
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStoreSection {
    #[serde(default)]
    pub mode: StoreMode,

    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// How long artifacts are kept before `prune` removes them.
    #[serde(default = "default_retention")]
    pub retention: String,
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".launchpad/artifacts")
}

fn default_retention() -> String {
    "168h".to_string()
}

impl Default for RawStoreSection {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            root: default_store_root(),
            retention: default_retention(),
        }
    }
}

/// `[dispatch]` section. Every field falls back to [`DispatchPolicy::default`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDispatchSection {
    pub provision_attempts: Option<u32>,
    pub provision_base_delay: Option<String>,
    pub provision_max_delay: Option<String>,
    pub request_timeout: Option<String>,
    pub provision_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub transfer_attempts: Option<u32>,
    pub transfer_retry_delay: Option<String>,
    pub transfer_timeout: Option<String>,
    pub start_timeout: Option<String>,
    pub run_window: Option<String>,
    pub max_command_len: Option<usize>,
    pub terminate_on_finish: Option<bool>,
}

/// `[tracker]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawTrackerSection {
    /// JSON-lines journal; in-memory only when absent.
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

/// `[provider]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProviderSection {
    #[serde(default)]
    pub kind: ProviderKind,

    /// Working directory root for local environments.
    #[serde(default = "default_provider_root")]
    pub root: PathBuf,

    #[serde(default = "default_max_environments")]
    pub max_environments: usize,
}

fn default_provider_root() -> PathBuf {
    PathBuf::from(".launchpad/envs")
}

fn default_max_environments() -> usize {
    4
}

impl Default for RawProviderSection {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            root: default_provider_root(),
            max_environments: default_max_environments(),
        }
    }
}

/// Validated configuration. Build with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub store: StoreConfig,
    pub dispatch: DispatchPolicy,
    pub tracker: RawTrackerSection,
    pub provider: RawProviderSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub mode: StoreMode,
    pub root: PathBuf,
    pub retention: Duration,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        store: StoreConfig,
        dispatch: DispatchPolicy,
        tracker: RawTrackerSection,
        provider: RawProviderSection,
    ) -> Self {
        Self {
            store,
            dispatch,
            tracker,
            provider,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        // The default raw config always validates.
        Self::new_unchecked(
            StoreConfig {
                mode: StoreMode::default(),
                root: default_store_root(),
                retention: Duration::from_secs(168 * 60 * 60),
            },
            DispatchPolicy::default(),
            RawTrackerSection::default(),
            RawProviderSection::default(),
        )
    }
}
