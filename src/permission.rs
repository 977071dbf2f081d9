use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// DDL authorization primitives.
///
/// - `GlobalAdmin` may run DDL against every non-protected schema.
/// - `SchemaDdl` is limited to one exact schema name.
///
/// Protected system schemas are rejected before the access policy is
/// consulted, so no permission opens them to ordinary callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    SchemaDdl { schema: String },
    GlobalAdmin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_id: String,
    // Reserved internal flag: never deserialize from untrusted input.
    #[serde(default, skip_deserializing)]
    internal_system: bool,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            internal_system: false,
        }
    }

    /// Context used by services that register introspection tables and
    /// system routines at start-up.
    pub fn system_internal() -> Self {
        Self {
            caller_id: "system".to_string(),
            internal_system: true,
        }
    }

    pub fn is_internal_system(&self) -> bool {
        self.internal_system && self.caller_id == "system"
    }
}

/// Yes/no decision on whether a caller may run DDL against a schema.
pub trait AccessPolicy: Send + Sync + std::fmt::Debug {
    fn is_accessible(&self, caller: &CallerContext, schema: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_accessible(&self, _caller: &CallerContext, _schema: &str) -> bool {
        true
    }
}

/// Explicit grants per caller id. Internal system callers are always
/// allowed.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    grants: HashMap<String, BTreeSet<Permission>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, caller_id: &str, permission: Permission) -> Self {
        self.grants
            .entry(caller_id.to_string())
            .or_default()
            .insert(permission);
        self
    }

    pub fn revoke(&mut self, caller_id: &str, permission: &Permission) -> bool {
        self.grants
            .get_mut(caller_id)
            .is_some_and(|set| set.remove(permission))
    }
}

impl AccessPolicy for GrantTable {
    fn is_accessible(&self, caller: &CallerContext, schema: &str) -> bool {
        if caller.is_internal_system() {
            return true;
        }
        let Some(granted) = self.grants.get(&caller.caller_id) else {
            return false;
        };
        granted.iter().any(|p| match p {
            Permission::GlobalAdmin => true,
            Permission::SchemaDdl { schema: s } => s == schema,
        })
    }
}
