use crate::error::{GraphError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Object type for users provisioned by the identity platform.
pub const USER_OBJECT_TYPE_ID: Uuid = Uuid::from_u128(0x1bf2_b775_e521_41d3_8b7e_78e8_9427_e6fe);
/// Object type for groups, including the group object backing each organization.
pub const GROUP_OBJECT_TYPE_ID: Uuid = Uuid::from_u128(0xf5bc_e640_f866_4464_af1a_9e7a_4e2c_6d07);
/// Object type for login applications.
pub const LOGIN_APP_OBJECT_TYPE_ID: Uuid = Uuid::from_u128(0x9b90_794f_0ed0_48d6_99a5_6fd5_78b9_f2ea);

pub const USER_OBJECT_TYPE_NAME: &str = "user";
pub const GROUP_OBJECT_TYPE_NAME: &str = "group";
pub const LOGIN_APP_OBJECT_TYPE_NAME: &str = "_login_app";

/// Type names that can never be deleted through the service.
pub const PROTECTED_OBJECT_TYPE_NAMES: &[&str] = &[
    USER_OBJECT_TYPE_NAME,
    GROUP_OBJECT_TYPE_NAME,
    LOGIN_APP_OBJECT_TYPE_NAME,
    "_access_policy",
    "_transformer",
    "_policies",
];

/// Fields shared by every stored entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseModel {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub version: i64,
}

impl BaseModel {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            created: now,
            updated: now,
            version: 0,
        }
    }
}

impl Default for BaseModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Common behaviour of the five graph entities
pub trait Entity: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static {
    /// Human readable kind, used in errors and audit records
    const KIND: &'static str;

    fn base(&self) -> &BaseModel;
    fn base_mut(&mut self) -> &mut BaseModel;

    /// Equality over the payload, ignoring id, timestamps and version
    fn equals_ignoring_id(&self, other: &Self) -> bool;

    fn validate(&self) -> Result<()>;

    fn id(&self) -> Uuid {
        self.base().id
    }
}

fn require_non_empty(kind: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GraphError::ValidationError(format!(
            "{} {} must not be empty",
            kind, field
        )));
    }
    Ok(())
}

// =============================================================================
// ObjectType
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    #[serde(flatten)]
    pub base: BaseModel,
    pub type_name: String,
}

impl ObjectType {
    pub fn new(type_name: &str) -> Self {
        Self {
            base: BaseModel::new(),
            type_name: type_name.to_string(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.base.id = id;
        self
    }

    pub fn user() -> Self {
        Self::new(USER_OBJECT_TYPE_NAME).with_id(USER_OBJECT_TYPE_ID)
    }

    pub fn group() -> Self {
        Self::new(GROUP_OBJECT_TYPE_NAME).with_id(GROUP_OBJECT_TYPE_ID)
    }

    pub fn login_app() -> Self {
        Self::new(LOGIN_APP_OBJECT_TYPE_NAME).with_id(LOGIN_APP_OBJECT_TYPE_ID)
    }

    pub fn is_protected(&self) -> bool {
        PROTECTED_OBJECT_TYPE_NAMES.contains(&self.type_name.as_str())
            || self.base.id == USER_OBJECT_TYPE_ID
            || self.base.id == GROUP_OBJECT_TYPE_ID
            || self.base.id == LOGIN_APP_OBJECT_TYPE_ID
    }
}

impl Entity for ObjectType {
    const KIND: &'static str = "object type";

    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }

    fn equals_ignoring_id(&self, other: &Self) -> bool {
        self.type_name == other.type_name
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::KIND, "type_name", &self.type_name)
    }
}

// =============================================================================
// Attribute / EdgeType
// =============================================================================

/// A named permission and how it flows across edges of one type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub inherit: bool,
    #[serde(default)]
    pub propagate: bool,
}

impl Attribute {
    pub fn new(name: &str, direct: bool, inherit: bool, propagate: bool) -> Self {
        Self {
            name: name.to_string(),
            direct,
            inherit,
            propagate,
        }
    }

    pub fn direct(name: &str) -> Self {
        Self::new(name, true, false, false)
    }

    pub fn inherit(name: &str) -> Self {
        Self::new(name, false, true, false)
    }

    pub fn propagate(name: &str) -> Self {
        Self::new(name, false, false, true)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[direct={} inherit={} propagate={}]",
            self.name, self.direct, self.inherit, self.propagate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeType {
    #[serde(flatten)]
    pub base: BaseModel,
    pub type_name: String,
    pub source_object_type_id: Uuid,
    pub target_object_type_id: Uuid,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub organization_id: Uuid,
}

impl EdgeType {
    pub fn new(
        type_name: &str,
        source_object_type_id: Uuid,
        target_object_type_id: Uuid,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            base: BaseModel::new(),
            type_name: type_name.to_string(),
            source_object_type_id,
            target_object_type_id,
            attributes,
            organization_id: Uuid::nil(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.base.id = id;
        self
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = organization_id;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

impl Entity for EdgeType {
    const KIND: &'static str = "edge type";

    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }

    fn equals_ignoring_id(&self, other: &Self) -> bool {
        if self.type_name != other.type_name
            || self.source_object_type_id != other.source_object_type_id
            || self.target_object_type_id != other.target_object_type_id
            || self.organization_id != other.organization_id
            || self.attributes.len() != other.attributes.len()
        {
            return false;
        }
        // attribute order is not significant
        let mine: HashSet<&Attribute> = self.attributes.iter().collect();
        other.attributes.iter().all(|a| mine.contains(a))
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::KIND, "type_name", &self.type_name)?;
        if self.source_object_type_id.is_nil() || self.target_object_type_id.is_nil() {
            return Err(GraphError::ValidationError(format!(
                "edge type {} must reference source and target object types",
                self.type_name
            )));
        }

        let mut seen = HashSet::new();
        for attribute in &self.attributes {
            require_non_empty("attribute", "name", &attribute.name)?;
            if !(attribute.direct || attribute.inherit || attribute.propagate) {
                return Err(GraphError::ValidationError(format!(
                    "attribute {} on edge type {} sets none of direct, inherit, propagate",
                    attribute.name, self.type_name
                )));
            }
            if !seen.insert(attribute.name.as_str()) {
                return Err(GraphError::ValidationError(format!(
                    "duplicate attribute {} on edge type {}",
                    attribute.name, self.type_name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Object / Edge
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    #[serde(flatten)]
    pub base: BaseModel,
    pub alias: Option<String>,
    pub type_id: Uuid,
    #[serde(default)]
    pub organization_id: Uuid,
}

impl Object {
    pub fn new(type_id: Uuid, alias: Option<&str>) -> Self {
        Self {
            base: BaseModel::new(),
            alias: alias.map(str::to_string),
            type_id,
            organization_id: Uuid::nil(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.base.id = id;
        self
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = organization_id;
        self
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}({})", alias, self.base.id),
            None => write!(f, "{}", self.base.id),
        }
    }
}

impl Entity for Object {
    const KIND: &'static str = "object";

    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }

    fn equals_ignoring_id(&self, other: &Self) -> bool {
        self.alias == other.alias
            && self.type_id == other.type_id
            && self.organization_id == other.organization_id
    }

    fn validate(&self) -> Result<()> {
        if self.type_id.is_nil() {
            return Err(GraphError::ValidationError(
                "object must reference an object type".to_string(),
            ));
        }
        if let Some(alias) = &self.alias {
            require_non_empty(Self::KIND, "alias", alias)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(flatten)]
    pub base: BaseModel,
    pub edge_type_id: Uuid,
    pub source_object_id: Uuid,
    pub target_object_id: Uuid,
}

impl Edge {
    pub fn new(edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Self {
        Self {
            base: BaseModel::new(),
            edge_type_id,
            source_object_id,
            target_object_id,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.base.id = id;
        self
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source_object_id, self.edge_type_id, self.target_object_id
        )
    }
}

impl Entity for Edge {
    const KIND: &'static str = "edge";

    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }

    fn equals_ignoring_id(&self, other: &Self) -> bool {
        self.edge_type_id == other.edge_type_id
            && self.source_object_id == other.source_object_id
            && self.target_object_id == other.target_object_id
    }

    fn validate(&self) -> Result<()> {
        if self.edge_type_id.is_nil()
            || self.source_object_id.is_nil()
            || self.target_object_id.is_nil()
        {
            return Err(GraphError::ValidationError(
                "edge must reference an edge type and two objects".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Organization
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(flatten)]
    pub base: BaseModel,
    pub name: String,
    #[serde(default)]
    pub region: String,
}

impl Organization {
    pub fn new(name: &str, region: &str) -> Self {
        Self {
            base: BaseModel::new(),
            name: name.to_string(),
            region: region.to_string(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.base.id = id;
        self
    }
}

impl Entity for Organization {
    const KIND: &'static str = "organization";

    fn base(&self) -> &BaseModel {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        &mut self.base
    }

    fn equals_ignoring_id(&self, other: &Self) -> bool {
        self.name == other.name && self.region == other.region
    }

    fn validate(&self) -> Result<()> {
        require_non_empty(Self::KIND, "name", &self.name)
    }
}

// =============================================================================
// Query results
// =============================================================================

/// Outcome of a create call; identical re-creates are not errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateOutcome {
    Created,
    Identical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAttributeResponse {
    pub has_attribute: bool,
    pub path: Vec<Edge>,
}

impl CheckAttributeResponse {
    pub fn denied() -> Self {
        Self {
            has_attribute: false,
            path: Vec::new(),
        }
    }
}
