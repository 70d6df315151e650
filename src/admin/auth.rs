//! Session authentication seam
//!
//! The core consumes a validator trait; real deployments plug in their own.
//! The in-memory implementation maps roles to members and keeps a set of
//! admin users holding the ROOT capability.

use std::collections::{BTreeSet, HashMap};

use crate::error::AuthError;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub user: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Capabilities beyond per-role membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Bypasses per-role authentication everywhere.
    Root,
}

/// Validates sessions against roles and capabilities.
pub trait SessionValidator: Send + Sync {
    /// The session may act on behalf of `role`.
    fn check_authenticated(&self, session: &SessionKey, role: &str) -> Result<(), AuthError>;

    /// The session holds `capability`.
    fn check_authorized(
        &self,
        session: &SessionKey,
        capability: Capability,
    ) -> Result<(), AuthError>;
}

/// Role-membership validator backed by in-memory maps.
#[derive(Debug, Default)]
pub struct InMemorySessionValidator {
    role_members: HashMap<String, BTreeSet<String>>,
    admins: BTreeSet<String>,
}

impl InMemorySessionValidator {
    pub fn with_role_member(mut self, role: impl Into<String>, user: impl Into<String>) -> Self {
        self.role_members
            .entry(role.into())
            .or_default()
            .insert(user.into());
        self
    }

    pub fn with_admin(mut self, user: impl Into<String>) -> Self {
        self.admins.insert(user.into());
        self
    }
}

impl SessionValidator for InMemorySessionValidator {
    fn check_authenticated(&self, session: &SessionKey, role: &str) -> Result<(), AuthError> {
        if self.admins.contains(&session.user) {
            return Ok(());
        }
        let is_member = self
            .role_members
            .get(role)
            .is_some_and(|members| members.contains(&session.user));
        if is_member {
            Ok(())
        } else {
            Err(AuthError(format!(
                "User {} is not authenticated for role {role}",
                session.user
            )))
        }
    }

    fn check_authorized(
        &self,
        session: &SessionKey,
        capability: Capability,
    ) -> Result<(), AuthError> {
        match capability {
            Capability::Root => {
                if self.admins.contains(&session.user) {
                    Ok(())
                } else {
                    Err(AuthError(format!(
                        "User {} does not hold the ROOT capability",
                        session.user
                    )))
                }
            }
        }
    }
}
