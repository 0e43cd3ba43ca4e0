use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a member inside an ArangoDB deployment.
///
/// Variant order is the role priority used to order plan actions:
/// agents first, sync components last.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ServerGroup {
    Agents,
    Single,
    #[serde(rename = "dbservers")]
    DbServers,
    Coordinators,
    #[serde(rename = "syncmasters")]
    SyncMasters,
    #[serde(rename = "syncworkers")]
    SyncWorkers,
}

impl ServerGroup {
    /// All groups in role priority order
    pub const ALL: [ServerGroup; 6] = [
        ServerGroup::Agents,
        ServerGroup::Single,
        ServerGroup::DbServers,
        ServerGroup::Coordinators,
        ServerGroup::SyncMasters,
        ServerGroup::SyncWorkers,
    ];

    /// Name used in spec/status field names
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerGroup::Agents => "agents",
            ServerGroup::Single => "single",
            ServerGroup::DbServers => "dbservers",
            ServerGroup::Coordinators => "coordinators",
            ServerGroup::SyncMasters => "syncmasters",
            ServerGroup::SyncWorkers => "syncworkers",
        }
    }

    /// Singular role name used in pod names and the role label
    pub fn role(&self) -> &'static str {
        match self {
            ServerGroup::Agents => "agent",
            ServerGroup::Single => "single",
            ServerGroup::DbServers => "dbserver",
            ServerGroup::Coordinators => "coordinator",
            ServerGroup::SyncMasters => "syncmaster",
            ServerGroup::SyncWorkers => "syncworker",
        }
    }

    /// Prefix of generated member ids, as ArangoDB itself names servers
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ServerGroup::Agents => "AGNT",
            ServerGroup::Single => "SNGL",
            ServerGroup::DbServers => "PRMR",
            ServerGroup::Coordinators => "CRDN",
            ServerGroup::SyncMasters => "SYNM",
            ServerGroup::SyncWorkers => "SYNW",
        }
    }

    /// Lowest member count the group may run with
    pub fn minimum_count(&self) -> i32 {
        match self {
            ServerGroup::Agents => 1,
            ServerGroup::Single => 1,
            ServerGroup::DbServers => 1,
            ServerGroup::Coordinators => 1,
            ServerGroup::SyncMasters => 1,
            ServerGroup::SyncWorkers => 1,
        }
    }

    /// Whether members of this group keep data on a persistent volume
    pub fn has_volume(&self) -> bool {
        matches!(
            self,
            ServerGroup::Agents | ServerGroup::Single | ServerGroup::DbServers
        )
    }

    /// Whether members of this group run arangosync instead of arangod
    pub fn is_arangosync(&self) -> bool {
        matches!(self, ServerGroup::SyncMasters | ServerGroup::SyncWorkers)
    }

    /// Whether members must be cleaned out before they are removed
    pub fn requires_clean_out(&self) -> bool {
        matches!(self, ServerGroup::DbServers)
    }

    /// Whether this group waits for an agent (or single server) to be ready
    /// before new members are created
    pub fn needs_bootstrap_peer(&self) -> bool {
        !matches!(self, ServerGroup::Agents | ServerGroup::Single)
    }

    /// Parse the singular role name used in labels
    pub fn from_role(role: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.role() == role)
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
