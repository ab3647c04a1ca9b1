//! Effect - A single side effect against the cloud, as a value
//!
//! Effects are produced by the differ and executed by the interpreter.
//! Nothing happens until an Effect is interpreted.

use crate::resource::{Resource, ResourceId, State};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Read a data source
    Read(Resource),
    /// Create a resource that does not exist yet
    Create(Resource),
    /// Update a resource in place
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Delete the existing resource and create it again, because an
    /// attribute that can't be changed in place differs
    Replace {
        from: State,
        to: Resource,
        forced_by: Vec<String>,
    },
    /// Delete a resource by its cloud identifier
    Delete { id: ResourceId, identifier: String },
}

impl Effect {
    /// Whether this Effect changes anything in the cloud
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::Read(_))
    }

    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Effect::Read(r) | Effect::Create(r) => &r.id,
            Effect::Update { id, .. } | Effect::Delete { id, .. } => id,
            Effect::Replace { to, .. } => &to.id,
        }
    }

    /// Single-character marker used in plan output
    pub fn symbol(&self) -> &'static str {
        match self {
            Effect::Read(_) => "<=",
            Effect::Create(_) => "+",
            Effect::Update { .. } => "~",
            Effect::Replace { .. } => "-/+",
            Effect::Delete { .. } => "-",
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Effect::Read(_) => "read",
            Effect::Create(_) => "create",
            Effect::Update { .. } => "update",
            Effect::Replace { .. } => "replace",
            Effect::Delete { .. } => "delete",
        };
        write!(f, "{} {}", verb, self.resource_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_is_not_mutating() {
        let read = Effect::Read(Resource::new("vpc", "lookup").with_read_only(true));
        assert!(!read.is_mutating());
        assert!(Effect::Create(Resource::new("vpc", "main")).is_mutating());
    }

    #[test]
    fn display_names_resource() {
        let effect = Effect::Delete {
            id: ResourceId::new("vpc_subnet", "web"),
            identifier: "subnet-1".to_string(),
        };
        assert_eq!(effect.to_string(), "delete vpc_subnet.web");
        assert_eq!(effect.symbol(), "-");
    }
}
