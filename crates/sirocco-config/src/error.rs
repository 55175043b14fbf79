//! Configuration error taxonomy.
//!
//! Configuration problems are raised at initialization only and are
//! fatal: a node with a broken configuration must not join a group.

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration source: {0}")]
    Source(#[from] config::ConfigError),

    #[error("required key {key:?} is missing")]
    MissingKey { key: String },

    #[error("key {key:?} has value {value:?}, expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("local_id {local_id} must be below max_node_id {max_node_id}")]
    NodeIdOutOfRange { local_id: u32, max_node_id: u32 },

    #[error(
        "subgroup profile {profile:?}: max_reply_payload_size {size} is below the minimum RPC response size {min}"
    )]
    ReplyPayloadTooSmall {
        profile: String,
        size: u64,
        min: u64,
    },

    #[error("json_layout and json_layout_file are mutually exclusive; specify exactly one")]
    AmbiguousLayout,

    #[error("no subgroup layout configured; set LAYOUT/json_layout or LAYOUT/json_layout_file")]
    MissingLayout,

    #[error("failed to read layout file {path}: {source}")]
    LayoutFileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("layout is not valid JSON: {0}")]
    InvalidLayoutJson(#[from] serde_json::Error),

    #[error("layout references subgroup profile {profile:?} but no [SUBGROUP/{profile}] section exists and no [SUBGROUP] default is configured")]
    UnknownProfile { profile: String },

    #[error("malformed command-line option {arg:?}; expected --SECTION/key=value or --SECTION/key value")]
    MalformedCliOption { arg: String },

    #[error("configuration was already initialized for this process")]
    AlreadyInitialized,
}
