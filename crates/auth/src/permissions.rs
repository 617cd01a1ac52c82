use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Role;

/// Permission identifier.
///
/// Permissions are opaque strings (e.g. "dispatch.read"). The wildcard `"*"`
/// grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    /// List and inspect jobs, validate contracts, read readiness.
    pub const DISPATCH_READ: Permission = Permission(Cow::Borrowed("dispatch.read"));
    /// Create dispatch jobs (finalize workflow).
    pub const DISPATCH_ENQUEUE: Permission = Permission(Cow::Borrowed("dispatch.enqueue"));
    /// Trigger retries, replay and force dead-letter.
    pub const DISPATCH_OPERATE: Permission = Permission(Cow::Borrowed("dispatch.operate"));
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static role → permission policy.
///
/// Unknown roles grant nothing.
pub fn permissions_for_role(role: &Role) -> Vec<Permission> {
    match role.as_str() {
        "admin" => vec![Permission::WILDCARD],
        "dispatch_operator" => vec![Permission::DISPATCH_READ, Permission::DISPATCH_OPERATE],
        "workflow_service" => vec![Permission::DISPATCH_ENQUEUE, Permission::DISPATCH_READ],
        "dispatch_viewer" => vec![Permission::DISPATCH_READ],
        _ => Vec::new(),
    }
}
