//! Subgroup layout, parsed from the `[LAYOUT]` JSON.
//!
//! The layout names every subgroup, partitions it into shards by node
//! id, and optionally restricts which shard members may send. Example:
//!
//! ```json
//! [
//!   {
//!     "name": "cache",
//!     "profile": "bulk",
//!     "mode": "ordered",
//!     "shards": [
//!       { "members": [1, 2, 3] },
//!       { "members": [4, 5, 6], "senders": [4] }
//!     ]
//!   }
//! ]
//! ```

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Delivery mode of a shard, as written in the layout JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    #[default]
    Ordered,
    Unordered,
}

/// One shard: its member node ids and, optionally, the subset allowed
/// to send. An absent `senders` list means every member may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    pub members: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<u32>>,
}

/// One subgroup: a name, the `[SUBGROUP/<profile>]` section supplying
/// its multicast parameters, and its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupLayout {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default)]
    pub mode: LayoutMode,
    pub shards: Vec<ShardLayout>,
}

/// The full subgroup layout of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Layout {
    pub subgroups: Vec<SubgroupLayout>,
}

impl Layout {
    /// Parses a layout from JSON text, surfacing parse failures as an
    /// explanatory configuration error.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// All node ids named anywhere in the layout, deduplicated.
    pub fn all_nodes(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .subgroups
            .iter()
            .flat_map(|sg| sg.shards.iter())
            .flat_map(|shard| shard.members.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
    [
      {
        "name": "cache",
        "profile": "bulk",
        "shards": [
          { "members": [1, 2, 3] },
          { "members": [4, 5, 6], "senders": [4] }
        ]
      },
      {
        "name": "meta",
        "mode": "unordered",
        "shards": [ { "members": [1, 4] } ]
      }
    ]
    "#;

    #[test]
    fn parses_example_layout() {
        let layout = Layout::from_json(EXAMPLE).unwrap();
        assert_eq!(layout.subgroups.len(), 2);
        assert_eq!(layout.subgroups[0].shards[1].senders, Some(vec![4]));
        assert_eq!(layout.subgroups[1].mode, LayoutMode::Unordered);
        assert_eq!(layout.all_nodes(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn invalid_json_is_an_explanatory_error() {
        let err = Layout::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLayoutJson(_)));
        assert!(err.to_string().contains("not valid JSON"));
    }
}
