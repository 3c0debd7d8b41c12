//! Host configuration (spec §3 `PmConfig` static fields + link endpoint naming),
//! loaded from a RON file the same way the teacher's `Config::load` reads
//! `config.ron` — `std::fs::read_to_string` + `ron::from_str`, errors bubbling up
//! through `anyhow`.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default path the host looks for on startup; overridable via `DCMESH_CONFIG`.
const DEFAULT_CONFIG_PATH: &str = "dcmesh.ron";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    pub power_manager: PmStaticConfig,
    pub link: LinkConfig,
}

/// The tunable constants of the balancing loop (spec §3 `PmConfig`). The
/// mutable, user-set fields (`threshold_mW`, `priority_node_id`) are not part of
/// the config file — they are runtime settings the CLI changes, owned by
/// [`crate::power_manager::PowerManager`].
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PmStaticConfig {
    pub poll_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub nudge_step: u8,
    pub deadband_mw: f64,
}

impl PmStaticConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

impl Default for PmStaticConfig {
    /// `nudge_step = 5`, `deadband = 50.0 mW` — chosen for documented four-cycle
    /// convergence since `original_source/` carried no reference values
    /// (Open Question resolution, recorded in DESIGN.md).
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            stale_threshold_secs: 5,
            nudge_step: 5,
            deadband_mw: 50.0,
        }
    }
}

/// Naming the link endpoint advertises under, and the re-scan/heartbeat timing
/// constants C6 uses (spec §4.6, §5).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LinkConfig {
    pub advertised_name_prefix: String,
    pub heartbeat_secs: u64,
    pub scan_timeout_secs: u64,
    pub reattach_retry_secs: u64,
}

impl LinkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn reattach_retry(&self) -> Duration {
        Duration::from_secs(self.reattach_retry_secs)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            advertised_name_prefix: "DCMESH-".to_string(),
            heartbeat_secs: 2,
            scan_timeout_secs: 5,
            reattach_retry_secs: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            power_manager: PmStaticConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl Config {
    /// Load from `DCMESH_CONFIG`, falling back to `dcmesh.ron` in the working
    /// directory, falling back again to built-in defaults if neither file
    /// exists — the host has no hard dependency on a config file the way the
    /// node firmware has no config file at all (embedded, spec's AMBIENT
    /// configuration note).
    pub fn load() -> Result<Config> {
        let path =
            std::env::var("DCMESH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(ron::from_str(&contents)?),
            Err(_) => Ok(Config::default()),
        }
    }
}
