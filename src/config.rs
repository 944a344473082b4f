use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/p2v-transfer/config.toml";

/// How unknown target host keys are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Show the fingerprint, ask, and remember the key if accepted.
    Ask,
    /// Only accept keys already present in the known hosts file.
    TrustStore,
}

impl HostKeyPolicy {
    /// Value for OpenSSH's `StrictHostKeyChecking` option.
    pub fn strict_host_key_checking(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::TrustStore => "yes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote user on the target instance.
    pub user: String,
    /// Where the source filesystems are mounted locally.
    pub source_mount: PathBuf,
    /// Where the new data partition is mounted on the target.
    pub target_mount: PathBuf,
    /// Candidate target disks, tried in order.
    pub target_disks: Vec<String>,
    pub fixes_command: String,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
    pub connect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Remote commands running longer than this get a one-time notice.
    pub slow_command_secs: u64,
    pub unmount_attempts: u32,
    pub unmount_retry_delay_ms: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            source_mount: PathBuf::from("/source"),
            target_mount: PathBuf::from("/target"),
            target_disks: vec![
                "/dev/xvda".to_string(),
                "/dev/vda".to_string(),
                "/dev/sda".to_string(),
            ],
            fixes_command: "run-parts /usr/lib/ganeti/fixes".to_string(),
            host_key_policy: HostKeyPolicy::Ask,
            known_hosts: default_known_hosts(),
            connect_timeout_secs: 30,
            poll_interval_ms: 10,
            slow_command_secs: 60,
            unmount_attempts: 3,
            unmount_retry_delay_ms: 500,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

fn default_known_hosts() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".ssh").join("known_hosts")
}

impl AppConfig {
    /// Build the configuration from defaults, an optional TOML file,
    /// `P2V_*` environment variables and finally command line overrides.
    ///
    /// An explicitly given config file must exist; the default one is
    /// optional.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        match config_file {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("Config file {} not found", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH));
            }
        }

        figment = figment.merge(Env::prefixed("P2V_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }
}
