//! Effect - Side effects represented as values
//!
//! An Effect describes one operation against a provider. Nothing happens
//! until the Interpreter executes it.

use crate::resource::{Resource, ResourceId, State};
use crate::schema::ReplacementPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Resource is not recorded in state
    Create(Resource),
    /// Every changed attribute can be updated in place
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// An immutable attribute changed, or the recorded object is tainted
    Replace {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
        policy: ReplacementPolicy,
    },
    /// Recorded object is no longer declared, or is a deposed leftover
    Delete {
        id: ResourceId,
        from: State,
        /// Delete the deposed object rather than the current one
        deposed: bool,
    },
    /// Recorded arguments match the declaration
    NoOp(Resource),
}

impl Effect {
    pub fn id(&self) -> &ResourceId {
        match self {
            Effect::Create(r) | Effect::NoOp(r) => &r.id,
            Effect::Update { id, .. } | Effect::Replace { id, .. } | Effect::Delete { id, .. } => {
                id
            }
        }
    }

    /// Desired resource for this effect, if any
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Effect::Create(r) | Effect::NoOp(r) => Some(r),
            Effect::Update { to, .. } | Effect::Replace { to, .. } => Some(to),
            Effect::Delete { .. } => None,
        }
    }

    /// Whether this effect changes anything
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::NoOp(_))
    }

    /// Operation name used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::Create(_) => "create",
            Effect::Update { .. } => "update",
            Effect::Replace { .. } => "replace",
            Effect::Delete { deposed: true, .. } => "delete (deposed)",
            Effect::Delete { .. } => "delete",
            Effect::NoOp(_) => "no-op",
        }
    }

    /// Identifier of the object this effect deletes, if any
    pub fn delete_target(&self) -> Option<&str> {
        match self {
            Effect::Delete {
                from,
                deposed: true,
                ..
            } => from.deposed.as_deref(),
            Effect::Delete { from, .. } | Effect::Replace { from, .. } => {
                from.identifier.as_deref()
            }
            _ => None,
        }
    }
}
