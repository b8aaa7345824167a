//! Node admission status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Admission status of a registered node, as opposed to its self-reported
/// activity. Status is controlled by the permissioning server: `Inactive`
/// nodes sit in the offline partition of the waiting pool, and `Banned`
/// nodes are removed from the network entirely.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
    Banned,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Banned => "banned",
        };
        f.write_str(s)
    }
}
