use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier carried in operator tokens.
///
/// Roles are opaque strings at this layer; [`crate::permissions_for_role`]
/// maps them to permissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const DISPATCH_OPERATOR: Role = Role(Cow::Borrowed("dispatch_operator"));
    pub const DISPATCH_VIEWER: Role = Role(Cow::Borrowed("dispatch_viewer"));
    pub const WORKFLOW_SERVICE: Role = Role(Cow::Borrowed("workflow_service"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
