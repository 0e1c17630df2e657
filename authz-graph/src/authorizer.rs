use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a caller is trying to do to a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    GetAll,
    GetOne,
    Create,
    Update,
    Delete,
    DeleteAll,
    /// Read-only graph queries and nested listings
    Query,
    /// Organization reassignment
    Migrate,
}

impl Action {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Action::Create | Action::Update | Action::Delete | Action::DeleteAll | Action::Migrate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    #[default]
    None,
    Member,
    Admin,
}

/// Identity of whoever is calling, as resolved by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    /// Used as the audit subject
    pub subject: String,
    /// The caller's own graph object, when it has one
    pub subject_id: Option<Uuid>,
    /// Organization claimed by the caller's token
    pub organization_id: Uuid,
    pub role: CallerRole,
}

impl CallerContext {
    pub fn new(subject: &str, organization_id: Uuid, role: CallerRole) -> Self {
        Self {
            subject: subject.to_string(),
            subject_id: None,
            organization_id,
            role,
        }
    }

    /// Internal caller for provisioning and the admin CLI
    pub fn system() -> Self {
        Self::new("system", Uuid::nil(), CallerRole::Admin)
    }

    pub fn with_subject_id(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }
}

/// Entry-level permission check for every service call.
///
/// `NestedRoleBased` guards collections that hang off a parent object
/// (`/objects/{id}/edges`): the caller must first be allowed to read the
/// parent, then the action itself is checked as for `RoleBased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Authorizer {
    AllowAll,
    /// Members read, admins write
    #[default]
    RoleBased,
    NestedRoleBased,
}

impl Authorizer {
    /// The authorizer for collections nested under this one
    pub fn nested(self) -> Self {
        match self {
            Authorizer::AllowAll => Authorizer::AllowAll,
            Authorizer::RoleBased | Authorizer::NestedRoleBased => Authorizer::NestedRoleBased,
        }
    }

    pub fn authorize(&self, action: Action, caller: &CallerContext, parent: Option<Uuid>) -> Result<()> {
        match self {
            Authorizer::AllowAll => Ok(()),
            Authorizer::RoleBased => role_gate(action, caller),
            Authorizer::NestedRoleBased => {
                let parent = parent.ok_or_else(|| {
                    GraphError::ValidationError("nested collection requires a parent ID".to_string())
                })?;
                role_gate(Action::Query, caller).map_err(|_| {
                    GraphError::Forbidden(format!("{} may not read object {}", caller.subject, parent))
                })?;
                role_gate(action, caller)
            }
        }
    }
}

fn role_gate(action: Action, caller: &CallerContext) -> Result<()> {
    let allowed = match caller.role {
        CallerRole::Admin => true,
        CallerRole::Member => !action.is_write(),
        CallerRole::None => false,
    };
    if !allowed {
        return Err(GraphError::Forbidden(format!(
            "{} ({:?}) may not perform {:?}",
            caller.subject, caller.role, action
        )));
    }
    Ok(())
}
