//! Configuration loader with multi-source layering.
//!
//! Precedence, lowest to highest: built-in defaults, the group
//! configuration file, the node configuration file, command-line long
//! options. File paths come from explicit builder calls, the
//! `SIROCCO_CONF_FILE` / `SIROCCO_NODE_CONF_FILE` environment variables,
//! or `sirocco.cfg` / `sirocco-node.cfg` in the working directory.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, FileFormat};

use crate::{
    ConfigError, CoreConfig, Layout, LoggerConfig, PersConfig, SiroccoConfig,
    SubgroupProfileConfig,
};

/// Environment variable naming the group configuration file.
pub const CONF_FILE_ENV: &str = "SIROCCO_CONF_FILE";
/// Environment variable naming the node configuration file.
pub const NODE_CONF_FILE_ENV: &str = "SIROCCO_NODE_CONF_FILE";

const DEFAULT_CONF_FILE: &str = "sirocco.cfg";
const DEFAULT_NODE_CONF_FILE: &str = "sirocco-node.cfg";

/// Builder for [`SiroccoConfig`].
#[derive(Debug)]
pub struct ConfigLoader {
    conf_file: Option<PathBuf>,
    node_conf_file: Option<PathBuf>,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            conf_file: None,
            node_conf_file: None,
            overrides: Vec::new(),
        }
    }

    /// Uses an explicit group configuration file instead of the
    /// environment/default discovery.
    pub fn with_conf_file(mut self, path: impl AsRef<Path>) -> Self {
        self.conf_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Uses an explicit node configuration file.
    pub fn with_node_conf_file(mut self, path: impl AsRef<Path>) -> Self {
        self.node_conf_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Adds one key override, e.g. `("SIROCCO/heartbeat_ms", "50")`.
    /// Overrides take precedence over every file source.
    pub fn with_override(mut self, key: &str, value: &str) -> Self {
        self.overrides.push((key.to_string(), value.to_string()));
        self
    }

    /// Parses command-line long options of the form
    /// `--SECTION/key=value` or `--SECTION/key value`. Tokens that do
    /// not look like configuration options are ignored, so the full
    /// process argument list can be passed through.
    pub fn with_cli_args<I>(mut self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut iter = args.into_iter().peekable();
        while let Some(arg) = iter.next() {
            let Some(stripped) = arg.strip_prefix("--") else {
                continue;
            };
            if !stripped.contains('/') {
                continue;
            }
            let (key, value) = match stripped.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => {
                    let value = iter
                        .next()
                        .ok_or_else(|| ConfigError::MalformedCliOption { arg: arg.clone() })?;
                    (stripped.to_string(), value)
                }
            };
            self.overrides.push((key, value));
        }
        Ok(self)
    }

    /// Loads, assembles, and validates the configuration.
    pub fn load(self) -> Result<SiroccoConfig, ConfigError> {
        let conf_file = self
            .conf_file
            .or_else(|| discover_file(CONF_FILE_ENV, DEFAULT_CONF_FILE));
        let node_conf_file = self
            .node_conf_file
            .or_else(|| discover_file(NODE_CONF_FILE_ENV, DEFAULT_NODE_CONF_FILE));

        let mut builder = Config::builder();
        if let Some(path) = &conf_file {
            builder = builder.add_source(
                config::File::from(path.clone())
                    .format(FileFormat::Ini)
                    .required(true),
            );
        }
        if let Some(path) = &node_conf_file {
            builder = builder.add_source(
                config::File::from(path.clone())
                    .format(FileFormat::Ini)
                    .required(true),
            );
        }
        for (key, value) in &self.overrides {
            builder = builder.set_override(override_path(key), value.clone())?;
        }
        let raw = builder.build()?;

        let core = load_core(&raw)?;
        let layout = load_layout(&raw)?;
        let default_profile = load_profile_section(&raw, "subgroup")?;
        let mut profiles = BTreeMap::new();
        for subgroup in &layout.subgroups {
            if let Some(name) = &subgroup.profile {
                let section = format!("subgroup/{}", name.to_lowercase());
                if let Some(profile) = load_profile_section(&raw, &section)? {
                    profiles.insert(name.to_lowercase(), profile);
                }
            }
        }
        let pers = load_pers(&raw)?;
        let logger = load_logger(&raw)?;

        let config = SiroccoConfig {
            core,
            profiles,
            default_profile,
            layout,
            pers,
            logger,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a `SECTION/key` option name to a layered-config path,
/// splitting at the last slash so `SUBGROUP/bulk/block_size` addresses
/// the `[SUBGROUP/bulk]` section.
fn override_path(key: &str) -> String {
    match key.rsplit_once('/') {
        Some((section, field)) => format!("{}.{}", section.to_lowercase(), field.to_lowercase()),
        None => key.to_lowercase(),
    }
}

fn discover_file(env_var: &str, default_name: &str) -> Option<PathBuf> {
    if let Ok(path) = env::var(env_var) {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(default_name);
    default.is_file().then_some(default)
}

// ============================================================================
// Per-section extraction
// ============================================================================

fn opt_string(raw: &Config, key: &str) -> Result<Option<String>, ConfigError> {
    match raw.get_string(key) {
        Ok(s) => Ok(Some(s)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    })
}

fn get_num<T: FromStr>(raw: &Config, key: &str, default: T) -> Result<T, ConfigError> {
    match opt_string(raw, key)? {
        Some(s) => parse_value(key, &s, "a number"),
        None => Ok(default),
    }
}

fn get_bool(raw: &Config, key: &str, default: bool) -> Result<bool, ConfigError> {
    match opt_string(raw, key)? {
        Some(s) => match s.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: other.to_string(),
                expected: "a boolean",
            }),
        },
        None => Ok(default),
    }
}

fn get_string(raw: &Config, key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(opt_string(raw, key)?.unwrap_or_else(|| default.to_string()))
}

fn load_core(raw: &Config) -> Result<CoreConfig, ConfigError> {
    let d = CoreConfig::default();
    let restart_leaders = match opt_string(raw, "sirocco.restart_leaders")? {
        Some(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        None => d.restart_leaders.clone(),
    };
    let restart_leader_ports = match opt_string(raw, "sirocco.restart_leader_ports")? {
        Some(s) => s
            .split(',')
            .map(|p| parse_value("sirocco.restart_leader_ports", p.trim(), "a port list"))
            .collect::<Result<_, _>>()?,
        None => d.restart_leader_ports.clone(),
    };
    Ok(CoreConfig {
        contact_ip: get_string(raw, "sirocco.contact_ip", &d.contact_ip)?,
        contact_port: get_num(raw, "sirocco.contact_port", d.contact_port)?,
        restart_leaders,
        restart_leader_ports,
        local_id: get_num(raw, "sirocco.local_id", d.local_id)?,
        local_ip: get_string(raw, "sirocco.local_ip", &d.local_ip)?,
        gms_port: get_num(raw, "sirocco.gms_port", d.gms_port)?,
        state_transfer_port: get_num(raw, "sirocco.state_transfer_port", d.state_transfer_port)?,
        sst_port: get_num(raw, "sirocco.sst_port", d.sst_port)?,
        rdmc_port: get_num(raw, "sirocco.rdmc_port", d.rdmc_port)?,
        external_port: get_num(raw, "sirocco.external_port", d.external_port)?,
        heartbeat_ms: get_num(raw, "sirocco.heartbeat_ms", d.heartbeat_ms)?,
        sst_poll_cq_timeout_ms: get_num(
            raw,
            "sirocco.sst_poll_cq_timeout_ms",
            d.sst_poll_cq_timeout_ms,
        )?,
        restart_timeout_ms: get_num(raw, "sirocco.restart_timeout_ms", d.restart_timeout_ms)?,
        enable_backup_restart_leaders: get_bool(
            raw,
            "sirocco.enable_backup_restart_leaders",
            d.enable_backup_restart_leaders,
        )?,
        disable_partitioning_safety: get_bool(
            raw,
            "sirocco.disable_partitioning_safety",
            d.disable_partitioning_safety,
        )?,
        max_p2p_request_payload_size: get_num(
            raw,
            "sirocco.max_p2p_request_payload_size",
            d.max_p2p_request_payload_size,
        )?,
        max_p2p_reply_payload_size: get_num(
            raw,
            "sirocco.max_p2p_reply_payload_size",
            d.max_p2p_reply_payload_size,
        )?,
        p2p_window_size: get_num(raw, "sirocco.p2p_window_size", d.p2p_window_size)?,
        max_node_id: get_num(raw, "sirocco.max_node_id", d.max_node_id)?,
        p2p_loop_busy_wait_before_sleep_ms: get_num(
            raw,
            "sirocco.p2p_loop_busy_wait_before_sleep_ms",
            d.p2p_loop_busy_wait_before_sleep_ms,
        )?,
    })
}

/// Loads one `[SUBGROUP…]` section, or `None` when the section is
/// entirely absent. Keys not present fall back to profile defaults.
fn load_profile_section(
    raw: &Config,
    section: &str,
) -> Result<Option<SubgroupProfileConfig>, ConfigError> {
    let keys = [
        "max_payload_size",
        "max_reply_payload_size",
        "max_smc_payload_size",
        "block_size",
        "window_size",
        "rdmc_send_algorithm",
    ];
    let present = keys
        .iter()
        .any(|k| matches!(opt_string(raw, &format!("{section}.{k}")), Ok(Some(_))));
    if !present {
        return Ok(None);
    }
    let d = SubgroupProfileConfig::default();
    let algorithm_key = format!("{section}.rdmc_send_algorithm");
    let send_algorithm = match opt_string(raw, &algorithm_key)? {
        Some(s) => s
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: algorithm_key.clone(),
                value: s,
                expected: "binomial_send, chain_send, sequential_send, or tree_send",
            })?,
        None => d.rdmc_send_algorithm,
    };
    Ok(Some(SubgroupProfileConfig {
        max_payload_size: get_num(raw, &format!("{section}.max_payload_size"), d.max_payload_size)?,
        max_reply_payload_size: get_num(
            raw,
            &format!("{section}.max_reply_payload_size"),
            d.max_reply_payload_size,
        )?,
        max_smc_payload_size: get_num(
            raw,
            &format!("{section}.max_smc_payload_size"),
            d.max_smc_payload_size,
        )?,
        block_size: get_num(raw, &format!("{section}.block_size"), d.block_size)?,
        window_size: get_num(raw, &format!("{section}.window_size"), d.window_size)?,
        rdmc_send_algorithm: send_algorithm,
    }))
}

fn load_layout(raw: &Config) -> Result<Layout, ConfigError> {
    let inline = opt_string(raw, "layout.json_layout")?;
    let file = opt_string(raw, "layout.json_layout_file")?;
    match (inline, file) {
        (Some(_), Some(_)) => Err(ConfigError::AmbiguousLayout),
        (Some(text), None) => Layout::from_json(&text),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(&path).map_err(|source| {
                ConfigError::LayoutFileUnreadable {
                    path: path.clone(),
                    source,
                }
            })?;
            Layout::from_json(&text)
        }
        (None, None) => Ok(Layout::default()),
    }
}

fn load_pers(raw: &Config) -> Result<PersConfig, ConfigError> {
    let d = PersConfig::default();
    Ok(PersConfig {
        file_path: get_string(raw, "pers.file_path", &d.file_path)?,
        ramdisk_path: get_string(raw, "pers.ramdisk_path", &d.ramdisk_path)?,
        reset: get_bool(raw, "pers.reset", d.reset)?,
        max_log_entry: get_num(raw, "pers.max_log_entry", d.max_log_entry)?,
        max_data_size: get_num(raw, "pers.max_data_size", d.max_data_size)?,
        private_key_file: opt_string(raw, "pers.private_key_file")?,
    })
}

fn load_logger(raw: &Config) -> Result<LoggerConfig, ConfigError> {
    let d = LoggerConfig::default();
    let default_log_level = get_string(raw, "logger.default_log_level", &d.default_log_level)?;
    let mut component_levels = BTreeMap::new();
    for component in ["sst", "rpc", "viewmanager", "persistence"] {
        let key = format!("logger.{component}_log_level");
        let level = opt_string(raw, &key)?.unwrap_or_else(|| default_log_level.clone());
        component_levels.insert(component.to_string(), level);
    }
    Ok(LoggerConfig {
        log_file_depth: get_num(raw, "logger.log_file_depth", d.log_file_depth)?,
        log_to_terminal: get_bool(raw, "logger.log_to_terminal", d.log_to_terminal)?,
        default_log_level,
        component_levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_conf(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write conf");
        path
    }

    const GROUP_CONF: &str = r#"
[SIROCCO]
contact_ip = 10.0.0.1
contact_port = 24000
heartbeat_ms = 50
max_node_id = 64

[SUBGROUP/bulk]
max_payload_size = 200000
block_size = 4096
rdmc_send_algorithm = chain_send

[LAYOUT]
json_layout = [ { "name": "cache", "profile": "bulk", "shards": [ { "members": [0, 1, 2] } ] } ]

[PERS]
reset = true

[LOGGER]
default_log_level = debug
viewmanager_log_level = trace
"#;

    #[test]
    fn loads_group_conf() {
        let dir = tempdir().unwrap();
        let conf = write_conf(dir.path(), "sirocco.cfg", GROUP_CONF);
        let config = ConfigLoader::new().with_conf_file(&conf).load().unwrap();

        assert_eq!(config.core.contact_ip, "10.0.0.1");
        assert_eq!(config.core.contact_port, 24_000);
        assert_eq!(config.core.heartbeat_ms, 50);
        // Untouched keys keep defaults.
        assert_eq!(config.core.sst_poll_cq_timeout_ms, 2_000);

        let profile = config.profile_for("bulk").unwrap();
        assert_eq!(profile.max_payload_size, 200_000);
        assert_eq!(profile.block_size, 4_096);
        assert_eq!(
            profile.send_algorithm,
            sirocco_types::SendAlgorithm::Chain
        );

        assert_eq!(config.layout.subgroups.len(), 1);
        assert!(config.pers.reset);
        assert_eq!(config.logger.component_levels["viewmanager"], "trace");
        // Unset component level falls back to the default level.
        assert_eq!(config.logger.component_levels["sst"], "debug");
    }

    #[test]
    fn node_conf_overrides_group_conf() {
        let dir = tempdir().unwrap();
        let conf = write_conf(dir.path(), "sirocco.cfg", GROUP_CONF);
        let node = write_conf(
            dir.path(),
            "sirocco-node.cfg",
            "[SIROCCO]\nlocal_id = 3\nheartbeat_ms = 25\n",
        );
        let config = ConfigLoader::new()
            .with_conf_file(&conf)
            .with_node_conf_file(&node)
            .load()
            .unwrap();
        assert_eq!(config.core.local_id, 3);
        assert_eq!(config.core.heartbeat_ms, 25);
        assert_eq!(config.core.contact_ip, "10.0.0.1");
    }

    #[test]
    fn cli_overrides_win() {
        let dir = tempdir().unwrap();
        let conf = write_conf(dir.path(), "sirocco.cfg", GROUP_CONF);
        let config = ConfigLoader::new()
            .with_conf_file(&conf)
            .with_cli_args(vec![
                "node".to_string(),
                "--SIROCCO/heartbeat_ms=10".to_string(),
                "--SUBGROUP/bulk/block_size".to_string(),
                "8192".to_string(),
            ])
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.core.heartbeat_ms, 10);
        assert_eq!(config.profile_for("bulk").unwrap().block_size, 8_192);
    }

    #[test]
    fn both_layout_keys_rejected() {
        let dir = tempdir().unwrap();
        let conf = write_conf(
            dir.path(),
            "sirocco.cfg",
            "[LAYOUT]\njson_layout = []\njson_layout_file = layout.json\n",
        );
        let err = ConfigLoader::new().with_conf_file(&conf).load().unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousLayout));
    }

    #[test]
    fn invalid_layout_json_rejected() {
        let dir = tempdir().unwrap();
        let conf = write_conf(
            dir.path(),
            "sirocco.cfg",
            "[LAYOUT]\njson_layout = { broken\n",
        );
        let err = ConfigLoader::new().with_conf_file(&conf).load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLayoutJson(_)));
    }

    #[test]
    fn out_of_range_local_id_rejected() {
        let dir = tempdir().unwrap();
        let conf = write_conf(
            dir.path(),
            "sirocco.cfg",
            "[SIROCCO]\nlocal_id = 64\nmax_node_id = 64\n",
        );
        let err = ConfigLoader::new().with_conf_file(&conf).load().unwrap_err();
        assert!(matches!(err, ConfigError::NodeIdOutOfRange { .. }));
    }

    #[test]
    fn dangling_value_option_rejected() {
        let err = ConfigLoader::new()
            .with_cli_args(vec!["--SIROCCO/heartbeat_ms".to_string()])
            .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedCliOption { .. }));
    }
}
