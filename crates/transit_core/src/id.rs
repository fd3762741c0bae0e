//! Identifiers for migrated entities
//!
//! Every entity is addressed by a store-scoped key. Models are keyed by UUID,
//! everything else by `<model-uuid>/<local-id>` inside its collection, so all
//! contention between concurrent migrations is partitioned by model.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;
use uuid::Uuid;

/// Container types a machine id may nest
pub const CONTAINER_TYPES: &[&str] = &["lxc", "lxd", "kvm"];

/// Errors that can occur when parsing identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum IdError {
    #[error("Invalid model UUID '{value}'")]
    #[diagnostic(
        code(transit_core::id::invalid_model_uuid),
        help("Model UUIDs use the hyphenated form, e.g. 'deadbeef-0bad-400d-8000-4b1d0d06f00d'")
    )]
    InvalidModelUuid {
        value: String,
        #[source]
        cause: uuid::Error,
    },

    #[error("'{0}' is not a valid machine id")]
    #[diagnostic(
        code(transit_core::id::invalid_machine_id),
        help("Machine ids look like '0', '3' or '3/lxc/0'; container types are lxc, lxd and kvm")
    )]
    InvalidMachineId(String),

    #[error("'{0}' is not a valid unit name")]
    #[diagnostic(
        code(transit_core::id::invalid_unit_name),
        help("Unit names are '<application>/<number>', e.g. 'mysql/0'")
    )]
    InvalidUnitName(String),
}

/// Globally unique model identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelUuid(Uuid);

impl ModelUuid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|cause| IdError::InvalidModelUuid {
                value: s.to_string(),
                cause,
            })
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for ModelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model:{}", self.0)
    }
}

impl Display for ModelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ModelUuid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Hierarchical machine id, e.g. `0` or `3/lxc/0`
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

fn is_machine_number(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'))
}

impl MachineId {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let segments: Vec<&str> = s.split('/').collect();
        let well_formed = segments.len() % 2 == 1
            && segments.iter().enumerate().all(|(i, seg)| {
                if i % 2 == 0 {
                    is_machine_number(seg)
                } else {
                    CONTAINER_TYPES.contains(seg)
                }
            });

        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(IdError::InvalidMachineId(s.to_string()))
        }
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The machine hosting this container, `None` for top-level machines
    pub fn parent(&self) -> Option<MachineId> {
        let (rest, _number) = self.0.rsplit_once('/')?;
        let (parent, _container_type) = rest.rsplit_once('/')?;
        Some(Self(parent.to_string()))
    }

    /// Agent tag used for this machine's on-disk config directory
    pub fn tag(&self) -> String {
        format!("machine-{}", self.0.replace('/', "-"))
    }
}

impl Ord for MachineId {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.split('/');
        let mut right = other.0.split('/');
        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    // Numbers carry no leading zeros, so length orders them first
                    let ordering = if is_machine_number(a) && is_machine_number(b) {
                        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
                    } else {
                        a.cmp(b)
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
            }
        }
    }
}

impl PartialOrd for MachineId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine:{}", self.0)
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MachineId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MachineId> for String {
    fn from(id: MachineId) -> Self {
        id.0
    }
}

/// Check an application name against the naming rules
pub fn is_valid_application_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    starts_with_letter
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
        // every dash-separated segment after the first needs a letter
        && name
            .split('-')
            .skip(1)
            .all(|seg| seg.chars().any(|c| c.is_ascii_lowercase()))
}

/// Check a relation endpoint name: a lowercase letter followed by lowercase
/// letters, digits, `-` or `_`, with no leading, trailing or doubled separator
pub fn is_valid_endpoint_name(name: &str) -> bool {
    let is_separator = |c: char| c == '-' || c == '_';
    name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || is_separator(c))
        && !name.ends_with(is_separator)
        && !name.contains("--")
        && !name.contains("__")
        && !name.contains("-_")
        && !name.contains("_-")
}

/// Unit name, `<application>/<number>`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName {
    application: String,
    number: u32,
}

impl UnitName {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let invalid = || IdError::InvalidUnitName(s.to_string());
        let (application, number) = s.split_once('/').ok_or_else(invalid)?;
        if !is_machine_number(number) || !is_valid_application_name(application) {
            return Err(invalid());
        }
        let number = number.parse().map_err(|_| invalid())?;
        Ok(Self {
            application: application.to_string(),
            number,
        })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Debug for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit:{}/{}", self.application, self.number)
    }
}

impl Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.number)
    }
}

impl FromStr for UnitName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UnitName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UnitName> for String {
    fn from(name: UnitName) -> Self {
        name.to_string()
    }
}

/// Relation key derived from the relation's endpoints
///
/// Endpoints are rendered as `application:relation`, sorted and joined by a
/// single space. Two relations over the same endpoints always share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationKey(String);

impl RelationKey {
    pub fn from_endpoint_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        Self(names.join(" "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store collection holding one kind of entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Model,
    Machine,
    Application,
    Unit,
    Relation,
}

impl Collection {
    /// Child collections in the order an import must write them
    pub const CHILDREN: [Collection; 4] = [
        Collection::Machine,
        Collection::Application,
        Collection::Unit,
        Collection::Relation,
    ];

    pub const ALL: [Collection; 5] = [
        Collection::Model,
        Collection::Machine,
        Collection::Application,
        Collection::Unit,
        Collection::Relation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Model => "model",
            Collection::Machine => "machine",
            Collection::Application => "application",
            Collection::Unit => "unit",
            Collection::Relation => "relation",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a single document in the store, rendered `collection:id`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: Collection,
    pub id: String,
}

impl DocumentKey {
    pub fn model(uuid: &ModelUuid) -> Self {
        Self {
            collection: Collection::Model,
            id: uuid.to_string(),
        }
    }

    /// Key of a child entity, scoped by its model's UUID
    pub fn scoped(collection: Collection, model: &ModelUuid, local_id: impl Display) -> Self {
        Self {
            collection,
            id: format!("{}/{}", model, local_id),
        }
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.id)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.id)
    }
}
