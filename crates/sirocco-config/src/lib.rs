//! # sirocco-config: node configuration
//!
//! INI-style configuration for Sirocco nodes, with four recognized
//! groups:
//!
//! - `[SIROCCO]`; node identity, contact/ports, protocol timeouts
//! - `[SUBGROUP/<name>]`; per-profile multicast parameters (a bare
//!   `[SUBGROUP]` section supplies defaults for unnamed profiles)
//! - `[LAYOUT]`; exactly one of `json_layout` (inline) or
//!   `json_layout_file`
//! - `[PERS]`; persistent log location and signing key
//! - `[LOGGER]`; log level per component, falling back to
//!   `default_log_level`
//!
//! Sources are layered with fixed precedence: command-line long options
//! override the node configuration file, which overrides the group
//! configuration file, which overrides built-in defaults. File paths are
//! discovered from explicit arguments, the `SIROCCO_CONF_FILE` /
//! `SIROCCO_NODE_CONF_FILE` environment variables, or the default file
//! names in the working directory.
//!
//! Configuration is a value created once at startup and passed explicitly
//! to constructors. For late callers a process-wide [`initialize_global`]
//! / [`global`] pair is retained as a fallback; re-initialization is
//! rejected rather than silently replaced.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sirocco_types::{SendAlgorithm, ShardProfile};

mod error;
mod layout;
mod loader;
mod logging;

pub use error::ConfigError;
pub use layout::{Layout, LayoutMode, ShardLayout, SubgroupLayout};
pub use loader::ConfigLoader;
pub use logging::init_logging;

/// Smallest permitted reply payload for RPC-style sends. Replies below
/// this size cannot carry the response envelope.
pub const MIN_RPC_RESPONSE_SIZE: u64 = 128;

// ============================================================================
// [SIROCCO] group
// ============================================================================

/// Keys of the `[SIROCCO]` group: identity, contact point, service
/// ports, and protocol timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// IP of the group's initial contact node.
    pub contact_ip: String,
    /// GMS port of the contact node.
    pub contact_port: u16,
    /// Comma-separated IPs of the restart leaders, in priority order.
    pub restart_leaders: Vec<String>,
    /// GMS ports of the restart leaders, parallel to `restart_leaders`.
    pub restart_leader_ports: Vec<u16>,
    /// This node's stable id. Must be below `max_node_id`.
    pub local_id: u32,
    /// This node's IP address.
    pub local_ip: String,
    pub gms_port: u16,
    pub state_transfer_port: u16,
    pub sst_port: u16,
    pub rdmc_port: u16,
    pub external_port: u16,
    /// Interval between heartbeat timestamp publications.
    pub heartbeat_ms: u32,
    /// A peer whose heartbeat stalls longer than this is suspected.
    pub sst_poll_cq_timeout_ms: u64,
    /// Bound on the wait for a quorum of the last view during restart.
    pub restart_timeout_ms: u64,
    /// Allow a backup restart leader to take over on restart timeout.
    pub enable_backup_restart_leaders: bool,
    /// Skip the majority check when installing a view. Dangerous; for
    /// test rigs only.
    pub disable_partitioning_safety: bool,
    pub max_p2p_request_payload_size: u64,
    pub max_p2p_reply_payload_size: u64,
    pub p2p_window_size: u32,
    /// Exclusive upper bound on node ids.
    pub max_node_id: u32,
    /// How long a P2P receive loop spins on its completion queue after
    /// the last observed event before parking on its condition variable.
    pub p2p_loop_busy_wait_before_sleep_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            contact_ip: "127.0.0.1".to_string(),
            contact_port: 23_580,
            restart_leaders: vec!["127.0.0.1".to_string()],
            restart_leader_ports: vec![23_580],
            local_id: 0,
            local_ip: "127.0.0.1".to_string(),
            gms_port: 23_580,
            state_transfer_port: 28_366,
            sst_port: 37_683,
            rdmc_port: 31_675,
            external_port: 32_645,
            heartbeat_ms: 100,
            sst_poll_cq_timeout_ms: 2_000,
            restart_timeout_ms: 10_000,
            enable_backup_restart_leaders: false,
            disable_partitioning_safety: false,
            max_p2p_request_payload_size: 10_240,
            max_p2p_reply_payload_size: 10_240,
            p2p_window_size: 16,
            max_node_id: 1_024,
            p2p_loop_busy_wait_before_sleep_ms: 10,
        }
    }
}

// ============================================================================
// [SUBGROUP/<name>] groups
// ============================================================================

/// Raw keys of one `[SUBGROUP/<name>]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupProfileConfig {
    pub max_payload_size: u64,
    pub max_reply_payload_size: u64,
    pub max_smc_payload_size: u64,
    pub block_size: u64,
    pub window_size: u32,
    pub rdmc_send_algorithm: SendAlgorithm,
}

impl Default for SubgroupProfileConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 10_240,
            max_reply_payload_size: 10_240,
            max_smc_payload_size: 10_240,
            block_size: 1_048_576,
            window_size: 16,
            rdmc_send_algorithm: SendAlgorithm::Binomial,
        }
    }
}

impl From<&SubgroupProfileConfig> for ShardProfile {
    fn from(p: &SubgroupProfileConfig) -> Self {
        ShardProfile {
            max_payload_size: p.max_payload_size,
            max_reply_payload_size: p.max_reply_payload_size,
            max_smc_payload_size: p.max_smc_payload_size,
            block_size: p.block_size,
            window_size: p.window_size,
            send_algorithm: p.rdmc_send_algorithm,
        }
    }
}

// ============================================================================
// [PERS] group
// ============================================================================

/// Keys of the `[PERS]` group: persistent log placement and signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersConfig {
    /// Directory for durable per-subgroup logs.
    pub file_path: String,
    /// Directory for the in-memory (ramdisk) variant.
    pub ramdisk_path: String,
    /// Truncate existing logs at startup.
    pub reset: bool,
    /// Upper bound on a single log entry, in bytes.
    pub max_log_entry: u64,
    /// Upper bound on a log's total payload bytes.
    pub max_data_size: u64,
    /// Ed25519 seed file for version signatures; signatures are disabled
    /// when unset.
    pub private_key_file: Option<String>,
}

impl Default for PersConfig {
    fn default() -> Self {
        Self {
            file_path: ".sirocco-pers".to_string(),
            ramdisk_path: "/dev/shm/sirocco".to_string(),
            reset: false,
            max_log_entry: 1_048_576,
            max_data_size: 1_073_741_824,
            private_key_file: None,
        }
    }
}

// ============================================================================
// [LOGGER] group
// ============================================================================

/// Keys of the `[LOGGER]` group.
///
/// Per-component levels (`sst_log_level`, `rpc_log_level`,
/// `viewmanager_log_level`, `persistence_log_level`) fall back to
/// `default_log_level` when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_file_depth: u32,
    pub log_to_terminal: bool,
    pub default_log_level: String,
    /// Component name → level, already fallback-resolved.
    pub component_levels: BTreeMap<String, String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let mut component_levels = BTreeMap::new();
        for component in ["sst", "rpc", "viewmanager", "persistence"] {
            component_levels.insert(component.to_string(), "info".to_string());
        }
        Self {
            log_file_depth: 3,
            log_to_terminal: true,
            default_log_level: "info".to_string(),
            component_levels,
        }
    }
}

// ============================================================================
// The assembled configuration
// ============================================================================

/// Fully loaded and validated node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiroccoConfig {
    pub core: CoreConfig,
    /// Named `[SUBGROUP/<name>]` profiles.
    pub profiles: BTreeMap<String, SubgroupProfileConfig>,
    /// The bare `[SUBGROUP]` section, used when a layout references a
    /// profile with no dedicated section.
    pub default_profile: Option<SubgroupProfileConfig>,
    pub layout: Layout,
    pub pers: PersConfig,
    pub logger: LoggerConfig,
}

impl SiroccoConfig {
    /// Resolves a layout profile reference to concrete multicast
    /// parameters.
    pub fn profile_for(&self, name: &str) -> Result<ShardProfile, ConfigError> {
        if let Some(p) = self.profiles.get(name) {
            return Ok(p.into());
        }
        if let Some(p) = &self.default_profile {
            return Ok(p.into());
        }
        Err(ConfigError::UnknownProfile {
            profile: name.to_string(),
        })
    }

    /// Cross-key validation, run by the loader after assembly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core.local_id >= self.core.max_node_id {
            return Err(ConfigError::NodeIdOutOfRange {
                local_id: self.core.local_id,
                max_node_id: self.core.max_node_id,
            });
        }
        if self.core.max_p2p_reply_payload_size < MIN_RPC_RESPONSE_SIZE {
            return Err(ConfigError::ReplyPayloadTooSmall {
                profile: "SIROCCO/max_p2p_reply_payload_size".to_string(),
                size: self.core.max_p2p_reply_payload_size,
                min: MIN_RPC_RESPONSE_SIZE,
            });
        }
        for (name, profile) in self
            .profiles
            .iter()
            .map(|(n, p)| (n.as_str(), p))
            .chain(self.default_profile.iter().map(|p| ("default", p)))
        {
            if profile.max_reply_payload_size < MIN_RPC_RESPONSE_SIZE {
                return Err(ConfigError::ReplyPayloadTooSmall {
                    profile: name.to_string(),
                    size: profile.max_reply_payload_size,
                    min: MIN_RPC_RESPONSE_SIZE,
                });
            }
        }
        for subgroup in &self.layout.subgroups {
            if let Some(profile) = &subgroup.profile {
                // Resolvability check; the concrete values are read at
                // view construction.
                self.profile_for(profile)?;
            }
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<SiroccoConfig> = OnceLock::new();

/// Installs the process-wide configuration fallback.
///
/// Intended for callers that cannot receive the configuration value
/// explicitly. At most one initialization per process; a second call is
/// an error rather than a silent replacement.
pub fn initialize_global(config: SiroccoConfig) -> Result<(), ConfigError> {
    GLOBAL
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)
}

/// The process-wide configuration, if [`initialize_global`] ran.
pub fn global() -> Option<&'static SiroccoConfig> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = SiroccoConfig {
            core: CoreConfig::default(),
            profiles: BTreeMap::new(),
            default_profile: Some(SubgroupProfileConfig::default()),
            layout: Layout::default(),
            pers: PersConfig::default(),
            logger: LoggerConfig::default(),
        };
        config.validate().unwrap();
    }

    #[test]
    fn local_id_must_be_below_max() {
        let mut config = SiroccoConfig {
            core: CoreConfig::default(),
            profiles: BTreeMap::new(),
            default_profile: None,
            layout: Layout::default(),
            pers: PersConfig::default(),
            logger: LoggerConfig::default(),
        };
        config.core.local_id = 1_024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NodeIdOutOfRange { .. })
        ));
    }

    #[test]
    fn tiny_reply_payload_rejected() {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "small".to_string(),
            SubgroupProfileConfig {
                max_reply_payload_size: 8,
                ..SubgroupProfileConfig::default()
            },
        );
        let config = SiroccoConfig {
            core: CoreConfig::default(),
            profiles,
            default_profile: None,
            layout: Layout::default(),
            pers: PersConfig::default(),
            logger: LoggerConfig::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReplyPayloadTooSmall { .. })
        ));
    }
}
