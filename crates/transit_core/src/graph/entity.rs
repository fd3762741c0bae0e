//! Entity types that make up a model graph

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::id::{MachineId, ModelUuid, RelationKey, UnitName, is_valid_endpoint_name};

/// Arbitrary key/value document attached to an entity
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Lifecycle of an entity. Only moves forward: alive, dying, dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// Whether an entity at `self` may move to `next`
    pub fn can_become(self, next: Life) -> bool {
        next >= self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The root entity being migrated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub uuid: ModelUuid,
    pub name: String,
    pub owner: String,
    pub config: Settings,
    pub life: Life,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineJob {
    HostUnits,
    ManageModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Ipv4,
    Ipv6,
    Hostname,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressScope {
    Public,
    LocalCloud,
    LocalMachine,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub value: String,
    pub kind: AddressKind,
    pub scope: AddressScope,
}

/// A provisioned host, or a container nested inside one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub life: Life,
    pub series: String,
    pub instance_id: Option<String>,
    pub addresses: Vec<NetworkAddress>,
    pub jobs: Vec<MachineJob>,
}

impl Machine {
    pub fn parent(&self) -> Option<MachineId> {
        self.id.parent()
    }

    pub fn hosts_units(&self) -> bool {
        self.jobs.contains(&MachineJob::HostUnits)
    }
}

/// A deployed charm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub charm_url: String,
    pub settings: Settings,
    pub exposed: bool,
    pub life: Life,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Allocating,
    Executing,
    Idle,
    Error,
    Failed,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: UnitStatus,
    pub message: String,
}

/// One instance of an application, placed on a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: UnitName,
    pub application: String,
    pub machine: MachineId,
    pub life: Life,
    pub agent_status: AgentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationRole {
    Provider,
    Requirer,
    Peer,
}

/// One side of a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub application: String,
    pub name: String,
    pub role: RelationRole,
    pub interface: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application, self.name)
    }
}

/// A relation between applications, with the settings each unit published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: u64,
    pub endpoints: Vec<Endpoint>,
    pub unit_settings: BTreeMap<UnitName, Settings>,
}

impl Relation {
    /// Key derived from the endpoints; never taken from stored data
    pub fn key(&self) -> RelationKey {
        RelationKey::from_endpoint_names(self.endpoints.iter().map(|e| e.to_string()))
    }

    pub fn involves(&self, application: &str) -> bool {
        self.endpoints.iter().any(|e| e.application == application)
    }

    pub fn is_peer(&self) -> bool {
        self.endpoints.len() == 1 && self.endpoints[0].role == RelationRole::Peer
    }

    /// Describe what is wrong with the endpoint set, if anything
    pub(crate) fn shape_problem(&self) -> Option<String> {
        if let Some(bad) = self
            .endpoints
            .iter()
            .find(|e| !is_valid_endpoint_name(&e.name))
        {
            return Some(format!(
                "endpoint name '{}' on '{}' is invalid",
                bad.name, bad.application
            ));
        }
        match self.endpoints.as_slice() {
            [] => Some("relation has no endpoints".to_string()),
            [single] if single.role != RelationRole::Peer => Some(format!(
                "single endpoint '{}' must have the peer role",
                single
            )),
            [_] => None,
            many => {
                if many.iter().any(|e| e.role == RelationRole::Peer) {
                    return Some("peer endpoints cannot join other applications".to_string());
                }
                let mut applications: Vec<&str> =
                    many.iter().map(|e| e.application.as_str()).collect();
                applications.sort_unstable();
                applications.dedup();
                if applications.len() != many.len() {
                    return Some("an application appears on more than one endpoint".to_string());
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_life_only_moves_forward() {
        assert!(Life::Alive.can_become(Life::Dying));
        assert!(Life::Dying.can_become(Life::Dead));
        assert!(Life::Dead.can_become(Life::Dead));
        assert!(!Life::Dead.can_become(Life::Alive));
        assert!(!Life::Dying.can_become(Life::Alive));
    }

    #[test]
    fn test_relation_shape() {
        let peer = Relation {
            id: 1,
            endpoints: vec![Endpoint {
                application: "etcd".to_string(),
                name: "cluster".to_string(),
                role: RelationRole::Peer,
                interface: "etcd".to_string(),
            }],
            unit_settings: BTreeMap::new(),
        };
        assert!(peer.is_peer());
        assert_eq!(peer.shape_problem(), None);
        assert_eq!(peer.key().as_str(), "etcd:cluster");

        let mut self_join = peer.clone();
        self_join.endpoints = vec![
            Endpoint {
                role: RelationRole::Provider,
                ..peer.endpoints[0].clone()
            },
            Endpoint {
                role: RelationRole::Requirer,
                name: "client".to_string(),
                ..peer.endpoints[0].clone()
            },
        ];
        assert!(self_join.shape_problem().is_some());
    }

    #[test]
    fn test_endpoint_names_cannot_smuggle_separators() {
        let mut relation = Relation {
            id: 2,
            endpoints: vec![Endpoint {
                application: "a".to_string(),
                name: "b c:d".to_string(),
                role: RelationRole::Peer,
                interface: "etcd".to_string(),
            }],
            unit_settings: BTreeMap::new(),
        };
        assert_eq!(
            relation.shape_problem(),
            Some("endpoint name 'b c:d' on 'a' is invalid".to_string())
        );

        for name in ["db-admin", "juju_info", "server2"] {
            relation.endpoints[0].name = name.to_string();
            assert_eq!(relation.shape_problem(), None, "{}", name);
        }
        for name in ["", "Db", "2db", "db-", "db__x", "db:x", "db x"] {
            relation.endpoints[0].name = name.to_string();
            assert!(relation.shape_problem().is_some(), "{}", name);
        }
    }
}
