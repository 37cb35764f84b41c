use shared::domain::{Identity, Role, Session};

/// Local mirror of who is signed in, with which role, and whether that
/// answer is still pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub identity: Option<Identity>,
    pub session: Option<Session>,
    pub role: Option<Role>,
    pub is_resolving: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            identity: None,
            session: None,
            role: None,
            is_resolving: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleStatus {
    Pending,
    Resolved(Role),
    /// Lookup failed or found no role; the session itself stays valid.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Bootstrapping,
    Anonymous,
    Authenticated(RoleStatus),
}

impl SessionState {
    pub fn signed_out() -> Self {
        Self {
            identity: None,
            session: None,
            role: None,
            is_resolving: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match (&self.identity, self.is_resolving, self.role) {
            (None, true, _) => SessionPhase::Bootstrapping,
            (None, false, _) => SessionPhase::Anonymous,
            (Some(_), true, _) => SessionPhase::Authenticated(RoleStatus::Pending),
            (Some(_), false, Some(role)) => SessionPhase::Authenticated(RoleStatus::Resolved(role)),
            (Some(_), false, None) => SessionPhase::Authenticated(RoleStatus::Failed),
        }
    }

    /// Role of the current identity; never reported without an identity.
    pub fn role(&self) -> Option<Role> {
        self.identity.as_ref().and(self.role)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}
