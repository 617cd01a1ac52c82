use serde::Serialize;
use thiserror::Error;

use courier_core::ActorId;

use crate::{Permission, Role, permissions_for_role};

/// A resolved principal for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub actor_id: ActorId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    /// Resolve effective permissions from roles using the static policy.
    pub fn from_roles(actor_id: ActorId, roles: Vec<Role>) -> Self {
        let mut permissions: Vec<Permission> = roles.iter().flat_map(permissions_for_role).collect();
        permissions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        permissions.dedup();
        Self {
            actor_id,
            roles,
            permissions,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal for one permission.
///
/// - No IO
/// - No panics
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let granted = principal
        .permissions
        .iter()
        .any(|p| p.is_wildcard() || p == required);

    if granted {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_wildcard_grants_everything() {
        let p = Principal::from_roles(ActorId::new(), vec![Role::ADMIN]);
        assert_eq!(authorize(&p, &Permission::DISPATCH_OPERATE), Ok(()));
        assert_eq!(authorize(&p, &Permission::DISPATCH_ENQUEUE), Ok(()));
    }

    #[test]
    fn viewer_cannot_operate() {
        let p = Principal::from_roles(ActorId::new(), vec![Role::DISPATCH_VIEWER]);
        assert_eq!(authorize(&p, &Permission::DISPATCH_READ), Ok(()));
        assert_eq!(
            authorize(&p, &Permission::DISPATCH_OPERATE),
            Err(AuthzError::Forbidden("dispatch.operate".to_string()))
        );
    }

    #[test]
    fn overlapping_roles_deduplicate_permissions() {
        let p = Principal::from_roles(
            ActorId::new(),
            vec![Role::DISPATCH_OPERATOR, Role::DISPATCH_VIEWER],
        );
        let reads = p.permissions.iter().filter(|x| **x == Permission::DISPATCH_READ).count();
        assert_eq!(reads, 1);
    }
}
