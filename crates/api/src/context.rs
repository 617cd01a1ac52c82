use courier_auth::Role;
use courier_core::ActorId;

/// Principal context for a request (authenticated identity + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    actor_id: ActorId,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn new(actor_id: ActorId, roles: Vec<Role>) -> Self {
        Self { actor_id, roles }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}
