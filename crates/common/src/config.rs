//! Config loader using TOML and serde.
//!
//! One file configures the whole coordinator: listening address, scheduling
//! parameters, NDF output paths, version minima, and the contact blocks
//! stamped into every published network definition.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parameters of the round scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Team size per round; also the pool threshold that triggers teaming.
    pub team_size: u32,
    /// Batch size stamped on every new round.
    pub batch_size: u32,
    /// Floor on inter-round start spacing, in milliseconds.
    pub minimum_delay_ms: u64,
    /// Gap between standby and the scheduled realtime start, in milliseconds.
    pub realtime_delay_ms: u64,
    /// Shuffle team order at extraction instead of using insertion order.
    pub random_ordering: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            team_size: 5,
            batch_size: 32,
            minimum_delay_ms: 1000,
            realtime_delay_ms: 2000,
            random_ordering: false,
        }
    }
}

/// Cyclic group parameters published in the NDF.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Prime modulus, hex encoded.
    pub prime: String,
    /// Generator, hex encoded.
    pub generator: String,
}

/// User discovery contact block published in the NDF.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdbConfig {
    /// Hex-encoded identifier of the user discovery service.
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub certificate: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address for the HTTP endpoints.
    pub listen_addr: String,

    /// Public address advertised as the permissioning contact in the NDF.
    pub public_addr: String,

    /// Output path for the full NDF (raw JSON).
    pub full_ndf_output_path: PathBuf,

    /// Output path for the base64 of the signed partial NDF.
    pub signed_partial_ndf_output_path: PathBuf,

    /// JSON file of one-time node registration codes.
    pub node_registration_codes_path: Option<PathBuf>,

    /// Where the RSA signing key is persisted between runs. Generated on
    /// first start if the file is absent.
    pub rsa_key_path: Option<PathBuf>,

    /// Minimum acceptable gateway version, if any.
    pub min_gateway_version: Option<String>,

    /// Minimum acceptable server version, if any.
    pub min_server_version: Option<String>,

    /// Ephemeral address space size stamped on round infos.
    pub address_space_size: u32,

    /// Bound on waiting for in-flight round starts during shutdown.
    pub close_timeout_ms: u64,

    /// Newline-separated list of node ids kept in the NDF but marked stale.
    pub disabled_nodes_path: Option<PathBuf>,

    /// How often the disabled-nodes list is re-read.
    pub disabled_nodes_poll_interval_ms: u64,

    /// Interval of the node activity tracker.
    pub node_metric_interval_ms: u64,

    /// A node whose last poll is older than this is pruned from the NDF.
    pub node_stale_after_ms: u64,

    /// Open client registrations allowed per window.
    pub client_registration_cap: u32,
    pub client_registration_window_ms: u64,

    pub scheduling: SchedulingConfig,
    pub udb: UdbConfig,
    pub cmix: GroupConfig,
    pub e2e: GroupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:8440".to_string(),
            public_addr: "127.0.0.1:8440".to_string(),
            full_ndf_output_path: PathBuf::from("./ndf.json"),
            signed_partial_ndf_output_path: PathBuf::from("./partial-ndf.b64"),
            node_registration_codes_path: None,
            rsa_key_path: None,
            min_gateway_version: None,
            min_server_version: None,
            address_space_size: 16,
            close_timeout_ms: 10_000,
            disabled_nodes_path: None,
            disabled_nodes_poll_interval_ms: 60_000,
            node_metric_interval_ms: 180_000,
            node_stale_after_ms: 600_000,
            client_registration_cap: 1000,
            client_registration_window_ms: 86_400_000,
            scheduling: SchedulingConfig::default(),
            udb: UdbConfig::default(),
            cmix: GroupConfig::default(),
            e2e: GroupConfig::default(),
        }
    }
}

/// Load config from a TOML file path.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: Config = toml::from_str(&s)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let def = Config::default();
        assert_eq!(def.scheduling.team_size, 5);
        assert!(def.min_server_version.is_none());
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            listen_addr = "0.0.0.0:8440"
            min_server_version = "3.1.0"
            address_space_size = 18

            [scheduling]
            team_size = 3
            batch_size = 64
            random_ordering = true

            [udb]
            id = "0a"
            address = "udb.example.com:11420"
        "#;
        write!(tmp, "{toml}").expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.listen_addr, "0.0.0.0:8440");
        assert_eq!(cfg.scheduling.team_size, 3);
        assert_eq!(cfg.scheduling.batch_size, 64);
        assert!(cfg.scheduling.random_ordering);
        // unset sections fall back to defaults
        assert_eq!(cfg.scheduling.minimum_delay_ms, 1000);
        assert_eq!(cfg.min_server_version.as_deref(), Some("3.1.0"));
        assert_eq!(cfg.udb.address, "udb.example.com:11420");
    }
}
