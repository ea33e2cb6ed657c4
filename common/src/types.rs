use serde::{Deserialize, Serialize};

/// Connectivity protocol for a registry entry, as written in the sqlhosts file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// TCP socket connection
    OnSocTcp,

    /// Shared-memory connection (same-host only)
    OnIpcShm,

    /// Replication (DR) TCP connection
    DrSocTcp,

    /// Protocol name we do not model; preserved verbatim for round-tripping
    Other(String),
}

impl ConnectionKind {
    pub fn wire_name(&self) -> &str {
        match self {
            ConnectionKind::OnSocTcp => "onsoctcp",
            ConnectionKind::OnIpcShm => "onipcshm",
            ConnectionKind::DrSocTcp => "drsoctcp",
            ConnectionKind::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "onsoctcp" => ConnectionKind::OnSocTcp,
            "onipcshm" => ConnectionKind::OnIpcShm,
            "drsoctcp" => ConnectionKind::DrSocTcp,
            other => ConnectionKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Lifecycle state of a database server instance.
///
/// `Initializing` is terminal on failure: partially-initialized storage must
/// not be retried on top of itself, so a failed init requires operator
/// intervention before any further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
    TornDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Uninitialized => "Uninitialized",
            NodeState::Initializing => "Initializing",
            NodeState::Running => "Running",
            NodeState::Stopped => "Stopped",
            NodeState::TornDown => "TornDown",
        };
        write!(f, "{s}")
    }
}

/// Replication role of a node, tracked explicitly rather than inferred from
/// which cluster collection the node happens to live in. Transitions are
/// validated by the cluster; a node never holds two secondary roles at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationRole {
    None,
    HdrPrimary,
    HdrSecondary,
    SdsPrimary,
    SdsSecondary,
    RssSecondary,
}

impl std::fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationRole::None => "None",
            ReplicationRole::HdrPrimary => "HdrPrimary",
            ReplicationRole::HdrSecondary => "HdrSecondary",
            ReplicationRole::SdsPrimary => "SdsPrimary",
            ReplicationRole::SdsSecondary => "SdsSecondary",
            ReplicationRole::RssSecondary => "RssSecondary",
        };
        write!(f, "{s}")
    }
}

/// The five kinds of storage space a node can allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceKind {
    Regular,
    Temp,
    Blob,
    SmartBlob,
    TempSmartBlob,
}

impl SpaceKind {
    /// The `onspaces -c` arguments selecting this kind for space `name`.
    pub fn create_args(&self, name: &str) -> String {
        match self {
            SpaceKind::Regular => format!("-c -d {name}"),
            SpaceKind::Temp => format!("-c -d {name} -t"),
            SpaceKind::Blob => format!("-c -b {name} -g 2"),
            SpaceKind::SmartBlob => format!("-c -S {name}"),
            SpaceKind::TempSmartBlob => format!("-c -S {name} -t"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_kind_round_trips() {
        for kind in ["onsoctcp", "onipcshm", "drsoctcp", "onsocssl"] {
            assert_eq!(ConnectionKind::parse(kind).wire_name(), kind);
        }
    }

    #[test]
    fn space_kind_create_args() {
        assert_eq!(SpaceKind::Regular.create_args("datadbs"), "-c -d datadbs");
        assert_eq!(SpaceKind::Temp.create_args("tempdbs"), "-c -d tempdbs -t");
        assert_eq!(SpaceKind::SmartBlob.create_args("sbs"), "-c -S sbs");
    }
}
