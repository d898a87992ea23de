//! Deterministic shard planning across CI nodes.
//!
//! Every CI node runs the same command with its own node index. Planning
//! works on zero-based indexes; CI matrices count nodes from 1, so the
//! command line goes through [`NodeSlot::from_number`]. Nodes never
//! talk to each other, so each one must compute its share from nothing but
//! the resolved plugin list, its index and the node count. Round-robin
//! assignment does that with local arithmetic:
//!
//! ```text
//! plugins:  A  B  C  D  E        node_count = 2
//! index:    0  1  2  3  4
//! node:     0  1  0  1  0        (index mod node_count)
//!
//! node 0 → [A, C, E]
//! node 1 → [B, D]
//! ```
//!
//! For a fixed list and node count the shards of all nodes partition the
//! list: no plugin is assigned twice and none is left out.
//!
//! # Example
//!
//! ```
//! use plugin_tests::plugin::PluginSpec;
//! use plugin_tests::shard::plan;
//!
//! let plugins: Vec<_> = ["A", "B", "C", "D", "E"]
//!     .into_iter()
//!     .map(PluginSpec::new)
//!     .collect();
//!
//! let node0 = plan(&plugins, 0, 2)?;
//! let ids: Vec<_> = node0.plugins().iter().map(|p| p.id.as_str()).collect();
//! assert_eq!(ids, ["A", "C", "E"]);
//! # Ok::<(), plugin_tests::config::ConfigError>(())
//! ```

use serde::Serialize;

use crate::config::ConfigError;
use crate::plugin::PluginSpec;

/// Position of this process in the CI fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeSlot {
    /// Zero-based index of this node.
    pub index: usize,
    /// Number of nodes sharing the plugin list.
    pub count: usize,
}

impl NodeSlot {
    /// Validates `0 <= index < count` and `count >= 1`.
    pub fn new(index: usize, count: usize) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidNodeCount(count));
        }
        if index >= count {
            return Err(ConfigError::NodeIndexOutOfRange { index, count });
        }
        Ok(Self { index, count })
    }

    /// Converts a 1-based CI node number (`1..=count`) into a slot.
    ///
    /// ```
    /// use plugin_tests::shard::NodeSlot;
    ///
    /// assert_eq!(NodeSlot::from_number(1, 2)?, NodeSlot::new(0, 2)?);
    /// assert!(NodeSlot::from_number(0, 2).is_err());
    /// # Ok::<(), plugin_tests::config::ConfigError>(())
    /// ```
    pub fn from_number(number: usize, count: usize) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidNodeCount(count));
        }
        if number == 0 || number > count {
            return Err(ConfigError::NodeNumberOutOfRange { number, count });
        }
        Ok(Self {
            index: number - 1,
            count,
        })
    }

    /// The 1-based node number, for display.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    /// A single node running everything.
    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    /// Returns `true` if the plugin at `position` belongs to this node.
    pub fn owns(&self, position: usize) -> bool {
        position % self.count == self.index
    }
}

/// The plugins assigned to one node, in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardPlan {
    slot: NodeSlot,
    plugins: Vec<PluginSpec>,
}

impl ShardPlan {
    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    pub fn plugins(&self) -> &[PluginSpec] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn into_plugins(self) -> Vec<PluginSpec> {
        self.plugins
    }
}

/// Computes the shard of node `node_index` out of `node_count`.
///
/// The plugin at position `i` goes to node `i % node_count`. Nodes beyond the
/// end of a short list get an empty plan.
///
/// # Errors
///
/// [`ConfigError`] if `node_count` is zero or `node_index >= node_count`.
pub fn plan(
    all_plugins: &[PluginSpec],
    node_index: usize,
    node_count: usize,
) -> Result<ShardPlan, ConfigError> {
    let slot = NodeSlot::new(node_index, node_count)?;
    Ok(plan_for(all_plugins, slot))
}

/// Computes the shard for an already validated slot.
pub fn plan_for(all_plugins: &[PluginSpec], slot: NodeSlot) -> ShardPlan {
    let plugins = all_plugins
        .iter()
        .enumerate()
        .filter(|(position, _)| slot.owns(*position))
        .map(|(_, plugin)| plugin.clone())
        .collect();

    ShardPlan { slot, plugins }
}

/// Computes the shards of every node, indexed by node.
pub fn plan_all(
    all_plugins: &[PluginSpec],
    node_count: usize,
) -> Result<Vec<ShardPlan>, ConfigError> {
    (0..node_count.max(1))
        .map(|index| plan(all_plugins, index, node_count))
        .collect()
}
